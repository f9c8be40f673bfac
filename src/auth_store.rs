//! Authentication state shared by the dispatcher and the auth flows.
//!
//! The store keeps the bearer token and the authenticated record, validates
//! token expiry on demand, and notifies observers on every change. An
//! optional persistence hook receives a serialized copy of each change; hook
//! calls are executed one at a time in the order they were produced.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use futures_util::future::BoxFuture;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event_stream::EventStream;
use crate::models::{RecordAuth, RecordModel};

/// Error type returned by persistence hooks.
pub type PersistError = Box<dyn StdError + Send + Sync>;

type PersistFuture = BoxFuture<'static, Result<(), PersistError>>;
type SaveHook = Arc<dyn Fn(String) -> PersistFuture + Send + Sync>;
type ClearHook = Arc<dyn Fn() -> PersistFuture + Send + Sync>;

/// Snapshot emitted on every [`AuthStore::save`] and [`AuthStore::clear`].
#[derive(Clone, Debug)]
pub struct AuthStoreEvent {
    pub token: SecretString,
    pub record: Option<RecordModel>,
}

/// Durable storage hooks for an [`AuthStore`].
#[derive(Clone)]
pub struct AuthPersistence {
    save: SaveHook,
    clear: Option<ClearHook>,
}

impl AuthPersistence {
    /// `save` receives `{"token": .., "record": ..}` serialized as JSON.
    pub fn new<S, Fut>(save: S) -> Self
    where
        S: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PersistError>> + Send + 'static,
    {
        Self {
            save: Arc::new(move |blob: String| -> PersistFuture { Box::pin(save(blob)) }),
            clear: None,
        }
    }

    /// Sets a dedicated clear hook. Without one, clearing saves an empty blob.
    pub fn with_clear<C, Fut>(mut self, clear: C) -> Self
    where
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PersistError>> + Send + 'static,
    {
        self.clear = Some(Arc::new(move || -> PersistFuture { Box::pin(clear()) }));
        self
    }
}

struct AuthState {
    token: SecretString,
    record: Option<RecordModel>,
}

struct Inner {
    state: RwLock<AuthState>,
    on_change: EventStream<AuthStoreEvent>,
    persistence: Option<(AuthPersistence, PersistQueue)>,
}

/// Cloneable handle to the shared auth state.
#[derive(Clone)]
pub struct AuthStore {
    inner: Arc<Inner>,
}

impl AuthStore {
    /// Creates an empty, memory-only store.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a store backed by `persistence`, loading `initial` if it is a
    /// previously persisted blob.
    pub fn persisted(persistence: AuthPersistence, initial: Option<&str>) -> Self {
        let store = Self::build(Some((persistence, PersistQueue::default())));
        if let Some(initial) = initial.filter(|blob| !blob.is_empty()) {
            match serde_json::from_str::<RecordAuth>(initial) {
                Ok(decoded) => {
                    let record = (!decoded.record.data().is_empty()).then_some(decoded.record);
                    store.save(decoded.token, record);
                }
                Err(err) => warn!(event = "auth_store_initial_ignored", error = %err),
            }
        }
        store
    }

    fn build(persistence: Option<(AuthPersistence, PersistQueue)>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(AuthState {
                    token: SecretString::new(String::new()),
                    record: None,
                }),
                on_change: EventStream::with_history_limit(1),
                persistence,
            }),
        }
    }

    /// Current token; empty when unauthenticated.
    pub fn token(&self) -> String {
        self.inner
            .state
            .read()
            .map(|state| state.token.expose_secret().clone())
            .unwrap_or_default()
    }

    /// Current authenticated record, if any.
    pub fn record(&self) -> Option<RecordModel> {
        self.inner
            .state
            .read()
            .ok()
            .and_then(|state| state.record.clone())
    }

    /// Change notifications. Replay delivers only the latest change.
    pub fn on_change(&self) -> &EventStream<AuthStoreEvent> {
        &self.inner.on_change
    }

    /// Returns `true` when the token is a JWT whose `exp` claim is in the future.
    pub fn is_valid(&self) -> bool {
        is_token_valid(&self.token())
    }

    /// Overwrites the token and record.
    pub fn save(&self, token: impl Into<String>, record: Option<RecordModel>) {
        let token = token.into();
        if let Ok(mut state) = self.inner.state.write() {
            state.token = SecretString::new(token.clone());
            state.record = record.clone();
        }

        if let Some((persistence, queue)) = &self.inner.persistence {
            let blob = json!({ "token": token, "record": record.clone() }).to_string();
            let save = Arc::clone(&persistence.save);
            queue.enqueue(Box::pin(async move { save(blob).await }));
        }

        self.inner.on_change.emit(AuthStoreEvent {
            token: SecretString::new(token),
            record,
        });
    }

    /// Resets the token to empty and drops the record.
    pub fn clear(&self) {
        if let Ok(mut state) = self.inner.state.write() {
            state.token = SecretString::new(String::new());
            state.record = None;
        }

        if let Some((persistence, queue)) = &self.inner.persistence {
            let op: PersistFuture = match &persistence.clear {
                Some(clear) => clear(),
                None => (persistence.save)(String::new()),
            };
            queue.enqueue(op);
        }

        self.inner.on_change.emit(AuthStoreEvent {
            token: SecretString::new(String::new()),
            record: None,
        });
    }
}

impl Default for AuthStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AuthStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthStore")
            .field("has_token", &!self.token().is_empty())
            .field("record_id", &self.record().map(|r| r.id().to_string()))
            .finish()
    }
}

/// Checks a JWT-shaped token for an `exp` claim later than now.
///
/// Never fails: any decoding problem means the token is not valid.
pub fn is_token_valid(token: &str) -> bool {
    match token_payload(token) {
        Some(payload) => {
            let exp = match payload.get("exp") {
                Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
                Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
                _ => None,
            };
            exp.is_some_and(|exp| exp > unix_now_secs())
        }
        None => false,
    }
}

/// Decodes the middle segment of a 3-part token as a JSON object.
pub(crate) fn token_payload(token: &str) -> Option<serde_json::Map<String, Value>> {
    if token.is_empty() {
        return None;
    }
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }

    let mut segment = parts[1].to_string();
    while segment.len() % 4 != 0 {
        segment.push('=');
    }
    let raw = URL_SAFE
        .decode(segment.as_bytes())
        .or_else(|_| STANDARD.decode(segment.as_bytes()))
        .ok()?;
    match serde_json::from_slice::<Value>(&raw).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn unix_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Sequential executor for persistence hooks.
///
/// The worker task is started lazily on the first enqueue so stores can be
/// built outside a runtime.
#[derive(Default)]
struct PersistQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<PersistFuture>>>,
}

impl PersistQueue {
    fn enqueue(&self, op: PersistFuture) {
        let Ok(mut guard) = self.tx.lock() else {
            return;
        };

        if guard.as_ref().map_or(true, |tx| tx.is_closed()) {
            let Ok(handle) = Handle::try_current() else {
                warn!(event = "auth_persist_skipped", reason = "no tokio runtime");
                return;
            };
            let (tx, rx) = mpsc::unbounded_channel();
            handle.spawn(run_persist_queue(rx));
            *guard = Some(tx);
        }

        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(op);
        }
    }
}

async fn run_persist_queue(mut rx: mpsc::UnboundedReceiver<PersistFuture>) {
    while let Some(op) = rx.recv().await {
        match op.await {
            Ok(()) => debug!(event = "auth_persisted"),
            Err(err) => warn!(event = "auth_persist_failed", error = %err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use secrecy::ExposeSecret;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::{is_token_valid, unix_now_secs, AuthPersistence, AuthStore, PersistError};
    use crate::models::RecordModel;

    fn token_with_payload(payload: serde_json::Value) -> String {
        format!(
            "eyJhbGciOiJIUzI1NiJ9.{}.signature",
            URL_SAFE_NO_PAD.encode(payload.to_string())
        )
    }

    #[test]
    fn expired_token_is_invalid() {
        let token = token_with_payload(json!({"exp": unix_now_secs() - 60}));
        assert!(!is_token_valid(&token));
    }

    #[test]
    fn future_token_is_valid() {
        let token = token_with_payload(json!({"exp": unix_now_secs() + 3600, "id": "u1"}));
        assert!(is_token_valid(&token));
    }

    #[test]
    fn malformed_tokens_are_invalid() {
        assert!(!is_token_valid(""));
        assert!(!is_token_valid("not.a"));
        assert!(!is_token_valid("not.a.jwt"));
        assert!(!is_token_valid(&token_with_payload(json!({"id": "no-exp"}))));
        assert!(!is_token_valid(&token_with_payload(json!({"exp": "soon"}))));
    }

    #[test]
    fn save_and_clear_notify_observers_with_replay() {
        let store = AuthStore::new();
        let record = RecordModel::from_value(json!({"id": "u1"}));
        store.save("abc", record);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.on_change().subscribe(
            move |event| {
                sink.lock()
                    .unwrap()
                    .push(event.token.expose_secret().clone())
            },
            true,
        );
        store.clear();

        assert_eq!(*seen.lock().unwrap(), vec!["abc".to_string(), String::new()]);
        assert_eq!(store.token(), "");
        assert!(store.record().is_none());
        assert!(!store.is_valid());
    }

    #[test]
    fn replay_delivers_only_the_latest_change() {
        let store = AuthStore::new();
        for token in ["one", "two", "three"] {
            store.save(token, None);
        }
        assert_eq!(store.on_change().history_len(), 1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.on_change().subscribe(
            move |event| {
                sink.lock()
                    .unwrap()
                    .push(event.token.expose_secret().clone())
            },
            true,
        );

        assert_eq!(*seen.lock().unwrap(), vec!["three".to_string()]);
    }

    #[test]
    fn debug_output_does_not_leak_token() {
        let store = AuthStore::new();
        store.save("super-secret-token", None);
        assert!(!format!("{store:?}").contains("super-secret-token"));
    }

    #[tokio::test]
    async fn persistence_hooks_run_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let save_tx = tx.clone();
        let persistence = AuthPersistence::new(move |blob: String| {
            let tx = save_tx.clone();
            async move {
                // Earlier saves sleep longer; ordering must still hold.
                let delay = if blob.contains("first") { 30 } else { 0 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let _ = tx.send(blob);
                Ok::<_, PersistError>(())
            }
        })
        .with_clear(move || {
            let tx = tx.clone();
            async move {
                let _ = tx.send("cleared".to_string());
                Ok::<_, PersistError>(())
            }
        });

        let store = AuthStore::persisted(persistence, None);
        store.save("first", None);
        store.save("second", None);
        store.clear();

        let mut received = Vec::new();
        for _ in 0..3 {
            let blob = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("persist hook timed out")
                .expect("persist channel open");
            received.push(blob);
        }

        assert!(received[0].contains("\"token\":\"first\""));
        assert!(received[1].contains("\"token\":\"second\""));
        assert_eq!(received[2], "cleared");
    }

    #[tokio::test]
    async fn initial_blob_is_loaded() {
        let persistence = AuthPersistence::new(|_blob: String| async { Ok::<_, PersistError>(()) });
        let initial = json!({"token": "t1", "record": {"id": "u1"}}).to_string();

        let store = AuthStore::persisted(persistence.clone(), Some(&initial));
        assert_eq!(store.token(), "t1");
        assert_eq!(store.record().map(|r| r.id().to_string()).as_deref(), Some("u1"));

        let ignored = AuthStore::persisted(persistence, Some("{not json"));
        assert_eq!(ignored.token(), "");
    }
}
