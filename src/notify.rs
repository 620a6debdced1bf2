//! Synchronous fan-out of connection snapshots and one-shot notices.
//!
//! Listeners are invoked in subscription order, on the caller's task, before
//! `publish`/`notify` returns. Internal locks are released before any
//! listener runs, so a listener may subscribe, unsubscribe or read state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::connection::ConnectionState;

/// One-shot, user-facing outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Sustained failure crossed the offline threshold. Emitted once per episode.
    OfflineModeEntered { consecutive_failures: u32 },
    /// Reachability restored after an outage or a forced reconnect.
    Reconnected,
    /// Queued writes were replayed.
    SyncCompleted { synced: usize, remaining: usize },
    /// A terminal failure worth surfacing.
    Error { message: String },
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            listeners: Vec::new(),
        }
    }
}

impl<T> Registry<T> {
    fn add(&mut self, listener: Listener<T>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.push((id, listener));
        id
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        before != self.listeners.len()
    }

    fn snapshot(&self) -> Vec<Listener<T>> {
        self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

#[derive(Default)]
struct Inner {
    current: ConnectionState,
    states: Registry<ConnectionState>,
    notices: Registry<Notice>,
}

#[derive(Clone, Copy)]
enum Channel {
    States,
    Notices,
}

/// Typed event bus for connection state.
#[derive(Clone, Default)]
pub struct NotificationSink {
    inner: Arc<Mutex<Inner>>,
}

impl NotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last published snapshot.
    pub fn current(&self) -> ConnectionState {
        self.lock().current.clone()
    }

    /// Register a state listener. It is called right away with the current
    /// snapshot, then on every published transition.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let listener: Listener<ConnectionState> = Arc::new(listener);
        let (id, current) = {
            let mut inner = self.lock();
            let id = inner.states.add(Arc::clone(&listener));
            (id, inner.current.clone())
        };
        listener(&current);
        self.handle(id, Channel::States)
    }

    /// Register a listener for one-shot notices. No replay.
    pub fn subscribe_notices<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Notice) + Send + Sync + 'static,
    {
        let id = self.lock().notices.add(Arc::new(listener));
        self.handle(id, Channel::Notices)
    }

    fn handle(&self, id: u64, channel: Channel) -> Subscription {
        Subscription {
            id,
            channel,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn publish(&self, state: &ConnectionState) {
        let listeners = {
            let mut inner = self.lock();
            inner.current = state.clone();
            inner.states.snapshot()
        };
        for listener in listeners {
            listener(state);
        }
    }

    pub fn notify(&self, notice: Notice) {
        tracing::debug!(?notice, "Dispatching notice");
        let listeners = self.lock().notices.snapshot();
        for listener in listeners {
            listener(&notice);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let inner = self.lock();
        inner.states.listeners.len() + inner.notices.listeners.len()
    }
}

/// Handle returned by `subscribe`; dropping it keeps the listener registered.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    channel: Channel,
    inner: Weak<Mutex<Inner>>,
}

impl Subscription {
    /// Returns false when the listener was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
        match self.channel {
            Channel::States => inner.states.remove(self.id),
            Channel::Notices => inner.notices.remove(self.id),
        }
    }
}
