//! Long-lived event-stream transport.
//!
//! [`SseClient`] holds the connection settings; [`SseClient::connect`] spawns
//! a background worker that owns the HTTP request, feeds received bytes to
//! the [`SseDecoder`], and reconnects according to the [`ReconnectPolicy`]
//! until it is closed or the policy gives up. Consumers observe the session
//! through the [`SseEvent`] receiver and control it through [`SseHandle`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::realtime::proto::{SseDecoder, SseMessage};
use crate::retry::ReconnectPolicy;

/// Failures reported by the transport. None of them are fatal on their own;
/// the worker reconnects after each one unless closed or exhausted.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SseError {
    /// The request could not be sent.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The backend answered with a non-2xx status.
    #[error("unexpected response status {0}")]
    Status(u16),

    /// Reading the response body failed mid-stream.
    #[error("read failed: {0}")]
    Read(String),

    /// The backend closed the response body.
    #[error("stream ended by server")]
    StreamEnded,

    /// The session was closed before it became usable.
    #[error("connection closed")]
    Closed,
}

/// Transport lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SseState {
    /// Created, worker not started yet.
    Idle,
    /// Request in flight.
    Connecting,
    /// Response accepted, body being read.
    Streaming,
    /// Waiting out the delay before reconnect number `attempt`.
    Reconnecting { attempt: usize },
    /// Terminal.
    Closed,
}

/// Events delivered to the transport consumer, in wire order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseEvent {
    /// A completed message.
    Message(SseMessage),
    /// A session ended; a reconnect may follow.
    Error(SseError),
    /// Sent exactly once; the receiver ends right after it.
    Closed,
}

/// How response bytes are acquired.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportStrategy {
    /// Incremental reads of the response body.
    #[default]
    Streaming,
    /// A detached download fills a shared buffer which is drained every
    /// `interval` into the decoder.
    Polling { interval: Duration },
}

/// Connection settings for one event-stream endpoint.
#[derive(Clone, Debug)]
pub struct SseClient {
    http: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
    policy: ReconnectPolicy,
    strategy: TransportStrategy,
}

impl SseClient {
    /// `http` must not carry a total request timeout, since the stream is
    /// expected to stay open indefinitely.
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            headers: BTreeMap::new(),
            policy: ReconnectPolicy::default(),
            strategy: TransportStrategy::default(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_strategy(mut self, strategy: TransportStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Spawns the connection worker. Must be called within a Tokio runtime.
    pub fn connect(&self) -> SseConnection {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SseState::Idle);

        tokio::spawn(sse_connection_worker(
            self.clone(),
            close_rx,
            state_tx,
            event_tx,
        ));

        SseConnection {
            handle: SseHandle {
                close_tx: Arc::new(close_tx),
                state_rx,
            },
            events: event_rx,
        }
    }

    async fn open(&self) -> Result<reqwest::Response, SseError> {
        let mut request = self.http.get(&self.url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|err| SseError::Connect(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SseError::Status(status.as_u16()));
        }
        Ok(response)
    }
}

/// A running transport session.
#[derive(Debug)]
pub struct SseConnection {
    handle: SseHandle,
    events: mpsc::UnboundedReceiver<SseEvent>,
}

impl SseConnection {
    pub fn handle(&self) -> SseHandle {
        self.handle.clone()
    }

    pub fn split(self) -> (SseHandle, mpsc::UnboundedReceiver<SseEvent>) {
        (self.handle, self.events)
    }

    pub async fn recv(&mut self) -> Option<SseEvent> {
        self.events.recv().await
    }
}

/// Cloneable control handle for a running transport session.
#[derive(Clone, Debug)]
pub struct SseHandle {
    close_tx: Arc<watch::Sender<bool>>,
    state_rx: watch::Receiver<SseState>,
}

impl SseHandle {
    /// Stops the session. Cancels an in-flight read or a pending reconnect
    /// delay. Calling it again has no effect.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    pub fn state(&self) -> SseState {
        *self.state_rx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow() || self.state() == SseState::Closed
    }
}

struct SessionEnd {
    error: SseError,
    retry_hint: i64,
}

async fn wait_for_close(close_rx: &mut watch::Receiver<bool>) {
    // Every handle dropped means nobody can close the session anymore.
    let _ = close_rx.wait_for(|closed| *closed).await;
}

/// Reconnects count against the policy for the lifetime of the connection,
/// including sessions that were accepted and later dropped.
async fn sse_connection_worker(
    client: SseClient,
    mut close_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<SseState>,
    event_tx: mpsc::UnboundedSender<SseEvent>,
) {
    let mut attempt = 0usize;

    loop {
        state_tx.send_replace(SseState::Connecting);
        debug!(event = "sse_connecting", url = %client.url, attempt);

        let end = tokio::select! {
            biased;
            _ = wait_for_close(&mut close_rx) => break,
            end = run_session(&client, &state_tx, &event_tx) => end,
        };

        if *close_rx.borrow() || event_tx.is_closed() {
            break;
        }

        warn!(event = "sse_session_failed", url = %client.url, error = %end.error, attempt);
        let _ = event_tx.send(SseEvent::Error(end.error));

        if client.policy.is_exhausted(attempt) {
            warn!(event = "sse_retries_exhausted", url = %client.url, attempts = attempt);
            break;
        }

        let delay = client.policy.delay_for_attempt(attempt, end.retry_hint);
        attempt += 1;
        state_tx.send_replace(SseState::Reconnecting { attempt });

        tokio::select! {
            biased;
            _ = wait_for_close(&mut close_rx) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    state_tx.send_replace(SseState::Closed);
    let _ = event_tx.send(SseEvent::Closed);
    debug!(event = "sse_closed", url = %client.url);
}

async fn run_session(
    client: &SseClient,
    state_tx: &watch::Sender<SseState>,
    event_tx: &mpsc::UnboundedSender<SseEvent>,
) -> SessionEnd {
    let response = match client.open().await {
        Ok(response) => response,
        Err(error) => {
            return SessionEnd {
                error,
                retry_hint: 0,
            }
        }
    };

    state_tx.send_replace(SseState::Streaming);
    debug!(event = "sse_streaming", url = %client.url);

    let mut decoder = SseDecoder::new();
    let mut retry_hint = 0;
    let error = match client.strategy {
        TransportStrategy::Streaming => {
            read_streaming(response, &mut decoder, event_tx, &mut retry_hint).await
        }
        TransportStrategy::Polling { interval } => {
            read_polling(response, interval, &mut decoder, event_tx, &mut retry_hint).await
        }
    };

    forward(decoder.finish(), event_tx, &mut retry_hint);
    SessionEnd { error, retry_hint }
}

fn forward(
    messages: Vec<SseMessage>,
    event_tx: &mpsc::UnboundedSender<SseEvent>,
    retry_hint: &mut i64,
) {
    for message in messages {
        *retry_hint = message.retry;
        let _ = event_tx.send(SseEvent::Message(message));
    }
}

async fn read_streaming(
    response: reqwest::Response,
    decoder: &mut SseDecoder,
    event_tx: &mpsc::UnboundedSender<SseEvent>,
    retry_hint: &mut i64,
) -> SseError {
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => forward(decoder.feed(&bytes), event_tx, retry_hint),
            Err(err) => return SseError::Read(err.to_string()),
        }
        if event_tx.is_closed() {
            return SseError::Closed;
        }
    }
    SseError::StreamEnded
}

#[derive(Default)]
struct PollBuffer {
    bytes: Vec<u8>,
    finished: Option<SseError>,
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Takes the bytes received since the last call, plus the download outcome
/// once it has finished.
fn drain_poll_buffer(buffer: &Mutex<PollBuffer>) -> (Vec<u8>, Option<SseError>) {
    let mut guard = buffer.lock().unwrap_or_else(PoisonError::into_inner);
    (std::mem::take(&mut guard.bytes), guard.finished.clone())
}

async fn download_into(response: reqwest::Response, buffer: Arc<Mutex<PollBuffer>>) {
    let mut body = response.bytes_stream();
    let finished = loop {
        match body.next().await {
            Some(Ok(bytes)) => buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .bytes
                .extend_from_slice(&bytes),
            Some(Err(err)) => break SseError::Read(err.to_string()),
            None => break SseError::StreamEnded,
        }
    };
    buffer.lock().unwrap_or_else(PoisonError::into_inner).finished = Some(finished);
}

async fn read_polling(
    response: reqwest::Response,
    interval: Duration,
    decoder: &mut SseDecoder,
    event_tx: &mpsc::UnboundedSender<SseEvent>,
    retry_hint: &mut i64,
) -> SseError {
    let buffer = Arc::new(Mutex::new(PollBuffer::default()));
    let _download = AbortOnDrop(tokio::spawn(download_into(response, Arc::clone(&buffer))));

    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let (fresh, finished) = drain_poll_buffer(&buffer);
        if !fresh.is_empty() {
            forward(decoder.feed(&fresh), event_tx, retry_hint);
        }
        if let Some(error) = finished {
            return error;
        }
        if event_tx.is_closed() {
            return SseError::Closed;
        }
    }
}
