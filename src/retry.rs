use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use crate::api::{BackendError, ErrorKind};
use crate::connection::ConnectionStateMachine;
use crate::queue::{OperationKind, QueueError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryError {
    #[error("Device is offline")]
    DeviceOffline,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl RetryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RetryError::DeviceOffline => ErrorKind::Network,
            RetryError::Backend(err) => err.kind(),
        }
    }
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error(transparent)]
    Retry(#[from] RetryError),
    #[error("Failed to queue write: {0}")]
    Queue(#[from] QueueError),
}

/// Where a write ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome<T> {
    Completed(T),
    /// Deferred to the offline queue under this id
    Queued(String),
}

/// Runs backend operations with bounded, probe-gated retries.
#[derive(Clone)]
pub struct RetryExecutor {
    machine: Arc<ConnectionStateMachine>,
}

impl RetryExecutor {
    pub fn new(machine: Arc<ConnectionStateMachine>) -> Self {
        Self { machine }
    }

    /// `execute_with_retry` with the configured attempt budget.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        self.execute_with_retry(op, self.machine.config().max_attempts)
            .await
    }

    /// Invoke `op` at most `max_attempts` times (0 counts as 1).
    ///
    /// Fails fast with `DeviceOffline` when the host is offline. Only
    /// network-class errors are retried: after a backoff of
    /// `base * 2^(attempt-1)` a fresh probe must confirm reachability,
    /// otherwise the last error is returned without spending more attempts.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        mut op: F,
        max_attempts: u32,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        if !self.machine.state().is_online {
            tracing::warn!("Skipping backend operation, device is offline");
            return Err(RetryError::DeviceOffline);
        }

        let max_attempts = max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(attempt = attempt, "Operation succeeded after retry");
                        self.machine.record_operation_success();
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.kind().is_retryable() {
                tracing::warn!(
                    attempt = attempt,
                    kind = ?err.kind(),
                    "Operation failed with non-retryable error: {}",
                    err
                );
                return Err(err.into());
            }

            if attempt >= max_attempts {
                tracing::warn!(
                    attempts = attempt,
                    "Operation failed after maximum attempts: {}",
                    err
                );
                return Err(err.into());
            }

            let delay = self.machine.config().backoff_delay(attempt - 1);
            tracing::info!(
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Operation failed with network error, retrying: {}",
                err
            );
            tokio::time::sleep(delay).await;

            if !self.machine.confirm_reachable().await {
                tracing::warn!("Backend still unreachable, not retrying: {}", err);
                return Err(err.into());
            }
        }
    }

    /// Run a write, deferring it to the offline queue when the device is
    /// offline, the machine is in offline mode, or retries end in a
    /// network-class failure.
    pub async fn execute_or_enqueue<T, F, Fut>(
        &self,
        kind: OperationKind,
        payload: Value,
        op: F,
    ) -> Result<WriteOutcome<T>, WriteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let state = self.machine.state();
        if !state.is_online || state.is_offline_mode {
            let id = self.machine.queue().enqueue(kind, payload)?;
            tracing::info!(operation_id = %id, kind = %kind, "Write queued while offline");
            return Ok(WriteOutcome::Queued(id));
        }

        match self.execute(op).await {
            Ok(value) => Ok(WriteOutcome::Completed(value)),
            Err(err) if err.kind() == ErrorKind::Network => {
                let id = self.machine.queue().enqueue(kind, payload)?;
                tracing::info!(
                    operation_id = %id,
                    kind = %kind,
                    "Write queued after network failure: {}",
                    err
                );
                Ok(WriteOutcome::Queued(id))
            }
            Err(err) => Err(err.into()),
        }
    }
}
