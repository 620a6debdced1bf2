//! Scripted `BackendClient` used by unit tests.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::{BackendClient, BackendError};
use crate::queue::QueuedOperation;

#[derive(Default)]
pub(crate) struct ScriptedBackend {
    probes: Mutex<VecDeque<Result<(), BackendError>>>,
    /// Answer once the script runs out
    fallback: Mutex<Option<BackendError>>,
    probe_delay: Option<Duration>,
    replay_delay: Option<Duration>,
    failing_replays: Mutex<HashSet<String>>,
    replayed: Mutex<Vec<String>>,
    probe_calls: AtomicUsize,
    completed: Arc<AtomicUsize>,
    cancelled: Arc<AtomicUsize>,
}

struct CancelGuard {
    done: bool,
    cancelled: Arc<AtomicUsize>,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.done {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl ScriptedBackend {
    pub(crate) fn healthy() -> Self {
        Self::default()
    }

    pub(crate) fn unreachable() -> Self {
        let backend = Self::default();
        *backend.fallback.lock().unwrap() = Some(network_error());
        backend
    }

    pub(crate) fn with_probes(probes: Vec<Result<(), BackendError>>) -> Self {
        let backend = Self::default();
        *backend.probes.lock().unwrap() = probes.into();
        backend
    }

    pub(crate) fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self
    }

    pub(crate) fn with_replay_delay(mut self, delay: Duration) -> Self {
        self.replay_delay = Some(delay);
        self
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        *self.fallback.lock().unwrap() = if reachable { None } else { Some(network_error()) };
    }

    pub(crate) fn fail_replay_of(&self, id: &str) {
        self.failing_replays.lock().unwrap().insert(id.to_string());
    }

    pub(crate) fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn completed_probes(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub(crate) fn cancelled_probes(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn replayed(&self) -> Vec<String> {
        self.replayed.lock().unwrap().clone()
    }
}

pub(crate) fn network_error() -> BackendError {
    BackendError::Network("connection refused".to_string())
}

#[async_trait]
impl BackendClient for ScriptedBackend {
    async fn probe_read(&self) -> Result<(), BackendError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let mut guard = CancelGuard {
            done: false,
            cancelled: Arc::clone(&self.cancelled),
        };

        if let Some(delay) = self.probe_delay {
            tokio::time::sleep(delay).await;
        }
        guard.done = true;
        self.completed.fetch_add(1, Ordering::SeqCst);

        let scripted = self.probes.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => match self.fallback.lock().unwrap().clone() {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }

    async fn replay(&self, operation: &QueuedOperation) -> Result<(), BackendError> {
        if let Some(delay) = self.replay_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_replays.lock().unwrap().contains(&operation.id) {
            return Err(network_error());
        }
        self.replayed.lock().unwrap().push(operation.id.clone());
        Ok(())
    }
}
