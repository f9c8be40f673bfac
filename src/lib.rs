//! Rust client SDK for PocketBase backends.
//!
//! The crate is organized by concern:
//! - `client`: the [`PocketBase`] entry point and the request dispatcher.
//! - `services`: collection records, batches, files, and health.
//! - `realtime`: SSE transport and the subscription registry.
//! - `auth_store`: observable token and auth record state.
//! - `retry`: reconnect delay policy.

/// Observable auth state with optional persistence.
pub mod auth_store;
/// Entry point, dispatcher, and request options.
pub mod client;
/// Error type returned by every request.
pub mod error;
/// Multicast handler list used for change notifications.
pub mod event_stream;
/// Response models.
pub mod models;
/// SSE transport, protocol types, and subscription registry.
pub mod realtime;
/// Reconnect delay policy.
pub mod retry;
/// REST services.
pub mod services;

pub use auth_store::{AuthPersistence, AuthStore, AuthStoreEvent};
pub use client::{filter, ClientOptions, FilePart, FilterParam, PocketBase, SendOptions};
pub use error::ClientError;
pub use models::{RecordAuth, RecordModel, RecordSubscriptionEvent, ResultList};
pub use realtime::{RealtimeService, SubscribeOptions};
pub use services::RequestOptions;
