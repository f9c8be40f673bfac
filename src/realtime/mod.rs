//! Realtime subscriptions over Server-Sent Events.
//!
//! - `proto`: SSE frame decoding, subscription keys, and the control message.
//! - `client`: reconnecting SSE transport.
//! - `service`: subscription registry sharing one transport session.

pub mod client;
pub mod proto;
pub mod service;

pub use client::{SseClient, SseConnection, SseError, SseEvent, SseHandle, SseState, TransportStrategy};
pub use proto::{SseDecoder, SseMessage, SubscribeOptions};
pub use service::{ListenerId, RealtimeOptions, RealtimeService, Unsubscribe};
