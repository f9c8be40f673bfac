//! Multicast event stream with optional history replay.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Identifier returned by [`EventStream::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    history: VecDeque<T>,
    history_limit: Option<usize>,
    handlers: Vec<(HandlerId, Handler<T>)>,
    next_id: u64,
}

/// Ordered list of handlers that also remembers emitted events.
///
/// Late subscribers can ask for the history to be replayed before live
/// events, so they observe the latest state without a separate read. With a
/// history limit only the newest events are kept.
pub struct EventStream<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> EventStream<T> {
    /// Stream that keeps every emitted event.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Stream that keeps at most `limit` of the newest events.
    pub fn with_history_limit(limit: usize) -> Self {
        Self::build(Some(limit))
    }

    fn build(history_limit: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                history: VecDeque::new(),
                history_limit,
                handlers: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// Records `event` and invokes every current handler in subscription order.
    pub fn emit(&self, event: T) {
        let handlers: Vec<Handler<T>> = match self.inner.lock() {
            Ok(mut guard) => {
                guard.history.push_back(event.clone());
                if let Some(limit) = guard.history_limit {
                    while guard.history.len() > limit {
                        guard.history.pop_front();
                    }
                }
                guard.handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
            }
            Err(_) => return,
        };
        for handler in handlers {
            handler(&event);
        }
    }

    /// Registers `handler`, first replaying past events when `replay_history`
    /// is set.
    pub fn subscribe<F>(&self, handler: F, replay_history: bool) -> HandlerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let handler: Handler<T> = Arc::new(handler);
        let (id, history) = match self.inner.lock() {
            Ok(mut guard) => {
                let id = HandlerId(guard.next_id);
                guard.next_id += 1;
                guard.handlers.push((id, Arc::clone(&handler)));
                let history: Vec<T> = if replay_history {
                    guard.history.iter().cloned().collect()
                } else {
                    Vec::new()
                };
                (id, history)
            }
            Err(_) => return HandlerId(u64::MAX),
        };
        for event in &history {
            handler(event);
        }
        id
    }

    /// Removes a handler. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: HandlerId) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.handlers.retain(|(handler_id, _)| *handler_id != id);
        }
    }

    pub fn clear_history(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.history.clear();
        }
    }

    pub fn clear_subscribers(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.handlers.clear();
        }
    }

    pub fn clear(&self) {
        self.clear_history();
        self.clear_subscribers();
    }

    /// Number of retained events.
    pub fn history_len(&self) -> usize {
        self.inner.lock().map(|g| g.history.len()).unwrap_or(0)
    }
}

impl<T: Clone> Default for EventStream<T> {
    fn default() -> Self {
        Self::new()
    }
}
