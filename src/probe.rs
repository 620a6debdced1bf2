use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::BackendClient;

/// Outcome of one reachability probe. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Tests service-level reachability with the cheapest backend read.
#[derive(Clone)]
pub struct HealthProber {
    backend: Arc<dyn BackendClient>,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(backend: Arc<dyn BackendClient>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Always resolves. A network-class failure or an expired deadline yields
    /// `success = false`; any answer from the backend, even an error, means
    /// it is reachable.
    ///
    /// The deadline drops the request future, which aborts the request
    /// instead of leaving it running in the background.
    pub async fn probe(&self) -> ProbeResult {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.backend.probe_read()).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(())) => ProbeResult {
                success: true,
                latency_ms: Some(latency_ms),
                error: None,
                timestamp: Utc::now(),
            },
            Ok(Err(err)) if !err.is_network() => ProbeResult {
                success: true,
                latency_ms: Some(latency_ms),
                error: Some(err.to_string()),
                timestamp: Utc::now(),
            },
            Ok(Err(err)) => ProbeResult {
                success: false,
                latency_ms: None,
                error: Some(err.to_string()),
                timestamp: Utc::now(),
            },
            Err(_) => ProbeResult {
                success: false,
                latency_ms: None,
                error: Some(format!("Probe timed out after {:?}", self.timeout)),
                timestamp: Utc::now(),
            },
        };

        if result.success {
            tracing::debug!(
                latency_ms = latency_ms,
                application_error = ?result.error,
                "Health probe succeeded"
            );
        } else {
            tracing::warn!(error = ?result.error, "Health probe failed");
        }

        result
    }
}
