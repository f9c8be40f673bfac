//! Subscription registry multiplexing every realtime topic over one
//! transport session.
//!
//! The registry owns the transport: it opens it lazily on the first
//! subscription, closes it once no listener is left, and keeps the backend's
//! push filter in sync by resubmitting the full key set whenever it changes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Map;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::client::{Dispatcher, SendOptions};
use crate::error::ClientError;
use crate::realtime::client::{SseClient, SseError, SseEvent, SseHandle, TransportStrategy};
use crate::realtime::proto::{
    subscription_key, SseMessage, SubscribeOptions, SubscriptionsRequest, CONNECT_EVENT,
};
use crate::retry::ReconnectPolicy;

/// Path of the realtime endpoint (stream and control message).
pub const REALTIME_PATH: &str = "/api/realtime";

type Listener = Arc<dyn Fn(&SseMessage) + Send + Sync>;
type DisconnectHook = Arc<dyn Fn(&[String]) + Send + Sync>;

/// Identifies one registered listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Transport settings used for every session the registry opens.
#[derive(Clone, Debug, Default)]
pub struct RealtimeOptions {
    pub policy: ReconnectPolicy,
    pub strategy: TransportStrategy,
}

#[derive(Clone, Debug)]
enum SessionStatus {
    Connecting,
    Ready,
    Failed(ConnectFailure),
}

/// Why a session never became ready.
#[derive(Clone, Debug)]
enum ConnectFailure {
    Transport(SseError),
    Submit {
        url: Option<String>,
        status: u16,
        message: String,
    },
}

impl ConnectFailure {
    fn into_error(self, stream_url: String) -> ClientError {
        match self {
            Self::Transport(source) => ClientError::Realtime {
                url: stream_url,
                source,
            },
            Self::Submit {
                url,
                status,
                message,
            } => ClientError::Application {
                url,
                status,
                response: Map::new(),
                message,
            },
        }
    }
}

struct Session {
    generation: u64,
    handle: SseHandle,
    status: watch::Receiver<SessionStatus>,
}

#[derive(Default)]
struct State {
    subscriptions: BTreeMap<String, Vec<(ListenerId, Listener)>>,
    client_id: String,
    session: Option<Session>,
    next_generation: u64,
    next_listener: u64,
    on_disconnect: Option<DisconnectHook>,
}

/// A session taken out of the registry, to be shut down outside the lock.
struct Detached {
    handle: SseHandle,
    established: bool,
    keys: Vec<String>,
    hook: Option<DisconnectHook>,
}

impl Detached {
    fn finish(self) {
        self.handle.close();
        if self.established {
            if let Some(hook) = self.hook {
                hook(&self.keys);
            }
        }
    }
}

enum Followup {
    Nothing,
    Resubmit,
    Disconnect(Option<Detached>),
}

struct Inner {
    dispatcher: Dispatcher,
    options: RealtimeOptions,
    state: Mutex<State>,
}

/// Realtime subscription registry.
#[derive(Clone)]
pub struct RealtimeService {
    inner: Arc<Inner>,
}

impl RealtimeService {
    pub fn new(dispatcher: Dispatcher, options: RealtimeOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                options,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Client id of the current session; empty while disconnected.
    pub fn client_id(&self) -> String {
        self.inner.lock().client_id.clone()
    }

    /// Returns `true` once the backend has assigned a client id.
    pub fn is_connected(&self) -> bool {
        !self.inner.lock().client_id.is_empty()
    }

    /// Live subscription keys, sorted by key. Submissions list them in the
    /// same order.
    pub fn subscription_keys(&self) -> Vec<String> {
        self.inner.lock().subscriptions.keys().cloned().collect()
    }

    /// Registers a hook called with the live keys whenever an established
    /// session is lost or closed.
    pub fn set_on_disconnect<F>(&self, hook: F)
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        self.inner.lock().on_disconnect = Some(Arc::new(hook));
    }

    /// Registers `listener` for `topic` and returns once the session is
    /// ready.
    ///
    /// Opens the transport when none is running. If the session fails
    /// before its first connect message the call fails, but the listener
    /// stays registered until it is explicitly unsubscribed.
    pub async fn subscribe<F>(
        &self,
        topic: &str,
        options: SubscribeOptions,
        listener: F,
    ) -> Result<Unsubscribe, ClientError>
    where
        F: Fn(&SseMessage) + Send + Sync + 'static,
    {
        let key = subscription_key(topic, &options);
        let (id, pending) = {
            let mut state = self.inner.lock();
            let id = ListenerId(state.next_listener);
            state.next_listener += 1;
            state
                .subscriptions
                .entry(key.clone())
                .or_default()
                .push((id, Arc::new(listener)));

            let pending = if state.session.is_none() {
                Some(self.open_session(&mut state))
            } else if state.client_id.is_empty() {
                state.session.as_ref().map(|s| s.status.clone())
            } else {
                None
            };
            (id, pending)
        };
        debug!(event = "realtime_subscribed", key = %key);

        match pending {
            Some(status) => self.wait_until_ready(status).await?,
            None => {
                let service = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = service.submit_subscriptions().await {
                        warn!(event = "realtime_resubmit_failed", error = %err);
                    }
                });
            }
        }

        Ok(Unsubscribe {
            service: self.clone(),
            key,
            id,
        })
    }

    /// Like [`subscribe`](Self::subscribe), but delivers messages into a
    /// channel instead of invoking a callback on the dispatch task.
    pub async fn subscribe_channel(
        &self,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<(Unsubscribe, mpsc::UnboundedReceiver<SseMessage>), ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let unsubscribe = self
            .subscribe(topic, options, move |message: &SseMessage| {
                let _ = tx.send(message.clone());
            })
            .await?;
        Ok((unsubscribe, rx))
    }

    /// Removes every key matching `topic`, or every key when `topic` is
    /// `None`.
    ///
    /// A key matches when `key + "?"` starts with the topic (with `?`
    /// appended unless the topic already has one), so `posts` removes
    /// `posts` and `posts?options=...` but not `posts/*`.
    pub async fn unsubscribe(&self, topic: Option<&str>) -> Result<(), ClientError> {
        let followup = {
            let mut state = self.inner.lock();
            let before = state.subscriptions.len();
            match topic.filter(|t| !t.is_empty()) {
                None => state.subscriptions.clear(),
                Some(topic) => {
                    let pattern = topic_pattern(topic);
                    state
                        .subscriptions
                        .retain(|key, _| !format!("{key}?").starts_with(&pattern));
                }
            }
            let changed = state.subscriptions.len() != before;
            followup(&mut state, changed)
        };
        self.apply(followup).await
    }

    /// Removes every key whose `key + "?"` starts with `prefix`.
    pub async fn unsubscribe_by_prefix(&self, prefix: &str) -> Result<(), ClientError> {
        let followup = {
            let mut state = self.inner.lock();
            let before = state.subscriptions.len();
            state
                .subscriptions
                .retain(|key, _| !format!("{key}?").starts_with(prefix));
            if state.subscriptions.len() == before {
                return Ok(());
            }
            followup(&mut state, true)
        };
        self.apply(followup).await
    }

    /// Removes a single listener from every key matching `topic`.
    pub async fn unsubscribe_by_topic_and_listener(
        &self,
        topic: &str,
        listener: ListenerId,
    ) -> Result<(), ClientError> {
        let pattern = topic_pattern(topic);
        let followup = {
            let mut state = self.inner.lock();
            let emptied = remove_listener(
                &mut state,
                |key| format!("{key}?").starts_with(&pattern),
                listener,
            );
            followup(&mut state, emptied)
        };
        self.apply(followup).await
    }

    async fn unsubscribe_key(&self, key: &str, listener: ListenerId) -> Result<(), ClientError> {
        let followup = {
            let mut state = self.inner.lock();
            let emptied = remove_listener(&mut state, |candidate| candidate == key, listener);
            followup(&mut state, emptied)
        };
        self.apply(followup).await
    }

    /// Sends the current client id and the full key list to the backend.
    /// Does nothing while no client id is assigned.
    pub async fn submit_subscriptions(&self) -> Result<(), ClientError> {
        submit(&self.inner).await
    }

    async fn apply(&self, followup: Followup) -> Result<(), ClientError> {
        match followup {
            Followup::Nothing => Ok(()),
            Followup::Resubmit => self.submit_subscriptions().await,
            Followup::Disconnect(detached) => {
                if let Some(detached) = detached {
                    debug!(event = "realtime_disconnected", reason = "no listeners");
                    detached.finish();
                }
                Ok(())
            }
        }
    }

    fn open_session(&self, state: &mut State) -> watch::Receiver<SessionStatus> {
        let dispatcher = &self.inner.dispatcher;
        let connection = SseClient::new(dispatcher.http(), self.stream_url())
            .with_policy(self.inner.options.policy.clone())
            .with_strategy(self.inner.options.strategy)
            .connect();
        let (handle, events) = connection.split();
        let (status_tx, status_rx) = watch::channel(SessionStatus::Connecting);

        state.next_generation += 1;
        let generation = state.next_generation;
        state.client_id.clear();
        state.session = Some(Session {
            generation,
            handle,
            status: status_rx.clone(),
        });
        debug!(event = "realtime_session_opened", generation);

        tokio::spawn(dispatch_events(
            Arc::downgrade(&self.inner),
            generation,
            events,
            status_tx,
        ));
        status_rx
    }

    async fn wait_until_ready(
        &self,
        mut status: watch::Receiver<SessionStatus>,
    ) -> Result<(), ClientError> {
        let outcome = match status
            .wait_for(|s| !matches!(s, SessionStatus::Connecting))
            .await
        {
            Ok(current) => current.clone(),
            Err(_) => SessionStatus::Failed(ConnectFailure::Transport(SseError::Closed)),
        };
        match outcome {
            SessionStatus::Failed(failure) => Err(failure.into_error(self.stream_url())),
            _ => Ok(()),
        }
    }

    fn stream_url(&self) -> String {
        self.inner.dispatcher.build_url(REALTIME_PATH, None)
    }
}

impl std::fmt::Debug for RealtimeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("RealtimeService")
            .field("client_id", &state.client_id)
            .field("keys", &state.subscriptions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes exactly one registered listener. Call
/// [`unsubscribe`](Self::unsubscribe) to consume it.
#[must_use = "dropping the handle keeps the listener registered"]
pub struct Unsubscribe {
    service: RealtimeService,
    key: String,
    id: ListenerId,
}

impl Unsubscribe {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn listener_id(&self) -> ListenerId {
        self.id
    }

    pub async fn unsubscribe(self) -> Result<(), ClientError> {
        self.service.unsubscribe_key(&self.key, self.id).await
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

fn topic_pattern(topic: &str) -> String {
    if topic.contains('?') {
        topic.to_string()
    } else {
        format!("{topic}?")
    }
}

/// Returns `true` when a key lost its last listener.
fn remove_listener(
    state: &mut State,
    matches: impl Fn(&str) -> bool,
    listener: ListenerId,
) -> bool {
    let mut emptied = false;
    state.subscriptions.retain(|key, listeners| {
        if !matches(key) {
            return true;
        }
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != listener);
        if listeners.is_empty() && before > 0 {
            emptied = true;
            return false;
        }
        true
    });
    emptied
}

fn followup(state: &mut State, changed: bool) -> Followup {
    if state.subscriptions.values().all(Vec::is_empty) {
        return Followup::Disconnect(detach(state, None));
    }
    if changed && !state.client_id.is_empty() {
        Followup::Resubmit
    } else {
        Followup::Nothing
    }
}

/// Takes the session out of the registry. With `generation` set, only that
/// session is taken.
fn detach(state: &mut State, generation: Option<u64>) -> Option<Detached> {
    let current = state.session.as_ref()?.generation;
    if generation.is_some_and(|g| g != current) {
        return None;
    }
    let session = state.session.take()?;
    let established = !state.client_id.is_empty();
    state.client_id.clear();
    Some(Detached {
        handle: session.handle,
        established,
        keys: state.subscriptions.keys().cloned().collect(),
        hook: state.on_disconnect.clone(),
    })
}

async fn submit(inner: &Inner) -> Result<(), ClientError> {
    let request = {
        let state = inner.lock();
        if state.client_id.is_empty() {
            return Ok(());
        }
        SubscriptionsRequest {
            client_id: state.client_id.clone(),
            subscriptions: state.subscriptions.keys().cloned().collect(),
        }
    };
    debug!(
        event = "realtime_submit",
        client_id = %request.client_id,
        keys = request.subscriptions.len()
    );
    let body = serde_json::to_value(&request)
        .map_err(|err| ClientError::application(format!("encode subscriptions: {err}")))?;
    inner
        .dispatcher
        .send(REALTIME_PATH, SendOptions::post().body(body))
        .await
        .map(|_| ())
}

fn is_ready(status_tx: &watch::Sender<SessionStatus>) -> bool {
    matches!(*status_tx.borrow(), SessionStatus::Ready)
}

/// Consumes transport events for one session generation.
async fn dispatch_events(
    registry: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<SseEvent>,
    status_tx: watch::Sender<SessionStatus>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = registry.upgrade() else {
            break;
        };

        match event {
            SseEvent::Message(message) => {
                if message.event == CONNECT_EVENT {
                    let current = {
                        let mut state = inner.lock();
                        let current = state
                            .session
                            .as_ref()
                            .is_some_and(|s| s.generation == generation);
                        if current {
                            state.client_id = message.id.clone();
                        }
                        current
                    };
                    if !current {
                        break;
                    }
                    debug!(event = "realtime_connected", client_id = %message.id);

                    match submit(&inner).await {
                        Ok(()) => {
                            status_tx.send_replace(SessionStatus::Ready);
                        }
                        Err(err) if !is_ready(&status_tx) => {
                            warn!(event = "realtime_initial_submit_failed", error = %err);
                            let detached = detach(&mut inner.lock(), Some(generation));
                            if let Some(detached) = detached {
                                detached.finish();
                            }
                            status_tx.send_replace(SessionStatus::Failed(ConnectFailure::Submit {
                                url: err.url().map(str::to_string),
                                status: err.status_code(),
                                message: err.to_string(),
                            }));
                            break;
                        }
                        Err(err) => {
                            warn!(event = "realtime_resubmit_failed", error = %err);
                        }
                    }
                }
                dispatch_message(&inner, &message);
            }
            SseEvent::Error(error) => {
                if !is_ready(&status_tx) {
                    let detached = detach(&mut inner.lock(), Some(generation));
                    if let Some(detached) = detached {
                        detached.finish();
                    }
                    status_tx.send_replace(SessionStatus::Failed(ConnectFailure::Transport(error)));
                    break;
                }

                let lost = {
                    let mut state = inner.lock();
                    let current = state
                        .session
                        .as_ref()
                        .is_some_and(|s| s.generation == generation);
                    if current && !state.client_id.is_empty() {
                        state.client_id.clear();
                        Some((
                            state.subscriptions.keys().cloned().collect::<Vec<_>>(),
                            state.on_disconnect.clone(),
                        ))
                    } else {
                        None
                    }
                };
                if let Some((keys, hook)) = lost {
                    debug!(event = "realtime_connection_lost", error = %error);
                    if let Some(hook) = hook {
                        hook(&keys);
                    }
                }
            }
            SseEvent::Closed => {
                let detached = detach(&mut inner.lock(), Some(generation));
                if let Some(detached) = detached {
                    debug!(event = "realtime_disconnected", reason = "transport closed");
                    detached.finish();
                }
                if !is_ready(&status_tx) {
                    status_tx.send_replace(SessionStatus::Failed(ConnectFailure::Transport(
                        SseError::Closed,
                    )));
                }
                break;
            }
        }
    }
}

fn dispatch_message(inner: &Inner, message: &SseMessage) {
    let listeners: Vec<Listener> = inner
        .lock()
        .subscriptions
        .get(&message.event)
        .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
        .unwrap_or_default();
    for listener in listeners {
        listener(message);
    }
}
