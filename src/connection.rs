use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::api::BackendClient;
use crate::notify::{Notice, NotificationSink};
use crate::probe::{HealthProber, ProbeResult};
use crate::queue::OfflineQueue;
use crate::sync::{SyncError, SyncReconciler, SyncResult};

/// Authoritative connectivity state. Only `ConnectionStateMachine` mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub is_online: bool,
    pub is_service_reachable: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub is_retrying: bool,
    pub is_offline_mode: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            is_online: true,
            is_service_reachable: true,
            last_probe_at: None,
            consecutive_failures: 0,
            is_retrying: false,
            is_offline_mode: false,
        }
    }
}

impl ConnectionState {
    pub fn phase(&self) -> ConnectionPhase {
        if !self.is_online {
            ConnectionPhase::Offline
        } else if self.is_offline_mode {
            ConnectionPhase::OfflineMode
        } else if !self.is_service_reachable || self.consecutive_failures > 0 {
            ConnectionPhase::OnlineDegraded
        } else {
            ConnectionPhase::OnlineHealthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionPhase {
    OnlineHealthy,
    /// Probes failing, reconnect scheduled
    OnlineDegraded,
    /// Host network down
    Offline,
    /// Degraded past the failure threshold; writes are queued
    OfflineMode,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionPhase::OnlineHealthy => "ONLINE_HEALTHY",
            ConnectionPhase::OnlineDegraded => "ONLINE_DEGRADED",
            ConnectionPhase::Offline => "OFFLINE",
            ConnectionPhase::OfflineMode => "OFFLINE_MODE",
        };
        f.write_str(name)
    }
}

/// Timing and threshold knobs for the state machine and the retry executor.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Period of background probes while online and not retrying
    pub probe_interval: Duration,
    /// Hard deadline for a single probe
    pub probe_timeout: Duration,
    /// Base of the exponential backoff
    pub backoff_base: Duration,
    /// Cap for a single backoff delay
    pub max_backoff: Duration,
    /// Scheduled reconnect probes per outage before falling back to the periodic probe
    pub max_reconnect_attempts: u32,
    /// Consecutive failures that switch the machine into offline mode
    pub offline_threshold: u32,
    /// Default attempt budget of `RetryExecutor::execute`
    pub max_attempts: u32,
    /// Randomize delays by a factor in [0.5, 1.5)
    pub use_jitter: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(60),
            max_reconnect_attempts: 5,
            offline_threshold: 3,
            max_attempts: 3,
            use_jitter: false,
        }
    }
}

impl ConnectionConfig {
    /// `backoff_base * 2^exponent`, capped at `max_backoff`.
    pub fn backoff_delay(&self, exponent: u32) -> Duration {
        let factor = 2u32.saturating_pow(exponent.min(20));
        let mut delay = self.backoff_base.saturating_mul(factor).min(self.max_backoff);

        if self.use_jitter {
            let jitter_factor = 0.5 + rand::random::<f64>();
            delay = delay.mul_f64(jitter_factor).min(self.max_backoff);
        }

        delay
    }
}

/// Outcome of a manual reconnect.
#[derive(Debug, Clone)]
pub struct ReconnectOutcome {
    pub probe: ProbeResult,
    /// Present when queued writes were replayed
    pub sync: Option<SyncResult>,
}

/// Aggregates host signals and probe results into one `ConnectionState`,
/// schedules backoff reconnects and triggers reconciliation on recovery.
///
/// Every mutation goes through `transition`, which publishes the new snapshot
/// to the `NotificationSink` before returning. Listeners may read `state()`
/// but must not call back into the machine's mutating operations.
pub struct ConnectionStateMachine {
    config: ConnectionConfig,
    state: RwLock<ConnectionState>,
    transition_lock: Mutex<()>,
    /// Bumped on every host offline signal; probe successes that started
    /// under an older value are stale.
    host_generation: AtomicU64,
    prober: HealthProber,
    probe_gate: tokio::sync::Mutex<()>,
    reconciler: Arc<SyncReconciler>,
    sink: NotificationSink,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionStateMachine {
    pub fn new(
        config: ConnectionConfig,
        backend: Arc<dyn BackendClient>,
        reconciler: Arc<SyncReconciler>,
        sink: NotificationSink,
    ) -> Arc<Self> {
        let prober = HealthProber::new(backend, config.probe_timeout);
        let initial = ConnectionState::default();
        sink.publish(&initial);

        Arc::new(Self {
            config,
            state: RwLock::new(initial),
            transition_lock: Mutex::new(()),
            host_generation: AtomicU64::new(0),
            prober,
            probe_gate: tokio::sync::Mutex::new(()),
            reconciler,
            sink,
            tasks: Mutex::new(Vec::new()),
            reconnect_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn sink(&self) -> &NotificationSink {
        &self.sink
    }

    pub fn reconciler(&self) -> &Arc<SyncReconciler> {
        &self.reconciler
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        self.reconciler.queue()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state().phase()
    }

    pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        self.config.backoff_delay(consecutive_failures)
    }

    /// Apply `update` and publish the resulting snapshot if anything changed.
    fn transition<R>(&self, update: impl FnOnce(&mut ConnectionState) -> R) -> (R, ConnectionState) {
        let _ordered = lock(&self.transition_lock);
        let (result, before, after) = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let before = state.clone();
            let result = update(&mut state);
            (result, before, state.clone())
        };

        if before != after {
            if before.phase() != after.phase() {
                tracing::info!(
                    from = %before.phase(),
                    to = %after.phase(),
                    consecutive_failures = after.consecutive_failures,
                    "Connection phase changed"
                );
            }
            self.sink.publish(&after);
        }

        (result, after)
    }

    /// Spawn the periodic probe loop. The first probe runs immediately.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() {
            tracing::warn!("Connection state machine already started, ignoring");
            return;
        }

        let machine = Arc::downgrade(self);
        let period = self.config.probe_interval;
        tracing::info!("Starting periodic health probes every {} seconds", period.as_secs());

        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(machine) = machine.upgrade() else {
                    break;
                };
                let state = machine.state();
                if state.is_online && !state.is_retrying {
                    machine.test_connection().await;
                }
            }
        }));
    }

    /// Abort every background task owned by the machine.
    pub fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        self.cancel_reconnect();
        tracing::info!(tasks = tasks.len(), "Connection state machine stopped");
    }

    /// Hand a task to the machine so `stop()` aborts it.
    pub fn track_task(&self, task: JoinHandle<()>) {
        lock(&self.tasks).push(task);
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
        self.transition(|s| s.is_retrying = false);
    }

    /// Host lost its network. No probe: host-level loss implies the service
    /// is unreachable.
    pub fn handle_host_offline(&self) {
        tracing::warn!("Host reported network loss");
        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
        self.transition(|s| {
            self.host_generation.fetch_add(1, Ordering::SeqCst);
            s.is_online = false;
            s.is_service_reachable = false;
            s.is_retrying = false;
        });
    }

    /// Host network is back. Reachability is not assumed; probe right away.
    pub async fn handle_host_online(self: &Arc<Self>) -> Option<ProbeResult> {
        tracing::info!("Host reported network available, probing backend");
        self.transition(|s| s.is_online = true);
        self.test_connection().await
    }

    /// Probe only when a failure is outstanding.
    pub async fn handle_visibility_regained(self: &Arc<Self>) -> Option<ProbeResult> {
        let state = self.state();
        if state.is_online && (state.consecutive_failures > 0 || !state.is_service_reachable) {
            tracing::debug!("Visibility regained with failures outstanding, probing backend");
            self.test_connection().await
        } else {
            None
        }
    }

    /// Run one probe unless another is in flight (then `None`). Drains the
    /// queue when the probe ends an outage.
    pub async fn test_connection(self: &Arc<Self>) -> Option<ProbeResult> {
        let Ok(gate) = self.probe_gate.try_lock() else {
            tracing::debug!("Health probe already in flight, skipping");
            return None;
        };

        let generation = self.host_generation.load(Ordering::SeqCst);
        let result = self.prober.probe().await;
        let recovered = self.apply_probe_result(&result, generation);
        drop(gate);

        if recovered {
            self.reconcile_if_pending().await;
        }
        Some(result)
    }

    /// Reachability verdict for the retry executor: our own probe, or the
    /// outcome of the one already in flight.
    pub async fn confirm_reachable(self: &Arc<Self>) -> bool {
        match self.test_connection().await {
            Some(result) => result.success,
            None => {
                let _gate = self.probe_gate.lock().await;
                self.state().is_service_reachable
            }
        }
    }

    /// Manual retry. On success the failure count resets and a non-empty
    /// queue is drained exactly once.
    pub async fn force_reconnect(self: &Arc<Self>) -> Result<ReconnectOutcome, SyncError> {
        tracing::info!("Forced reconnect requested");

        let gate = self.probe_gate.lock().await;
        let generation = self.host_generation.load(Ordering::SeqCst);
        let probe = self.prober.probe().await;
        let recovered = self.apply_probe_result(&probe, generation);
        drop(gate);

        if !probe.success {
            self.sink.notify(Notice::Error {
                message: format!(
                    "Still unable to reach the service: {}",
                    probe.error.as_deref().unwrap_or("unknown error")
                ),
            });
            return Ok(ReconnectOutcome { probe, sync: None });
        }

        if !recovered {
            self.sink.notify(Notice::Reconnected);
        }

        let sync = if self.queue().is_empty().map_err(SyncError::from)? {
            None
        } else {
            match self.reconciler.reconcile().await {
                Ok(result) => Some(result),
                Err(SyncError::InProgress) => {
                    tracing::info!("Queue is already being drained, not starting another drain");
                    None
                }
                Err(e) => return Err(e),
            }
        };

        Ok(ReconnectOutcome { probe, sync })
    }

    /// A retried operation went through: the backend is reachable, and so is
    /// the network.
    pub fn record_operation_success(self: &Arc<Self>) {
        let (recovered, _) = self.transition(|s| {
            let recovered = s.is_offline_mode || !s.is_online;
            s.is_online = true;
            s.is_service_reachable = true;
            s.consecutive_failures = 0;
            s.is_offline_mode = false;
            recovered
        });

        if recovered {
            self.sink.notify(Notice::Reconnected);
            let machine = Arc::clone(self);
            tokio::spawn(async move {
                machine.reconcile_if_pending().await;
            });
        }
    }

    /// Fold a probe result into the state. Returns true when the probe ended
    /// an outage (the service was unreachable and now answers).
    ///
    /// `generation` is the host generation read before the probe started. A
    /// success that raced a host offline signal leaves the offline state alone.
    fn apply_probe_result(self: &Arc<Self>, result: &ProbeResult, generation: u64) -> bool {
        if result.success {
            let (recovered, _) = self.transition(|s| {
                s.last_probe_at = Some(result.timestamp);
                if self.host_generation.load(Ordering::SeqCst) != generation {
                    return None;
                }
                let recovered = !s.is_online || !s.is_service_reachable || s.is_offline_mode;
                s.is_online = true;
                s.is_service_reachable = true;
                s.consecutive_failures = 0;
                s.is_offline_mode = false;
                Some(recovered)
            });
            let Some(recovered) = recovered else {
                tracing::debug!("Host went offline while the probe was in flight, ignoring its success");
                return false;
            };
            if recovered {
                tracing::info!("Backend reachable again");
                self.sink.notify(Notice::Reconnected);
            }
            return recovered;
        }

        let threshold = self.config.offline_threshold;
        let (entered_offline_mode, state) = self.transition(|s| {
            s.is_service_reachable = false;
            s.consecutive_failures = s.consecutive_failures.saturating_add(1);
            s.last_probe_at = Some(result.timestamp);
            if s.is_online && !s.is_offline_mode && s.consecutive_failures >= threshold {
                s.is_offline_mode = true;
                true
            } else {
                false
            }
        });

        if entered_offline_mode {
            tracing::warn!(
                consecutive_failures = state.consecutive_failures,
                "Entering offline mode, writes will be queued"
            );
            self.sink.notify(Notice::OfflineModeEntered {
                consecutive_failures: state.consecutive_failures,
            });
        }

        if state.is_online {
            self.schedule_reconnect();
        }
        false
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.config.max_reconnect_attempts == 0 {
            return;
        }

        let mut slot = lock(&self.reconnect_task);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        self.transition(|s| s.is_retrying = true);
        let machine = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            machine.run_reconnect_loop().await;
        }));
    }

    async fn run_reconnect_loop(self: Arc<Self>) {
        for attempt in 1..=self.config.max_reconnect_attempts {
            let delay = self.backoff_delay(self.state().consecutive_failures);
            tracing::info!(
                attempt = attempt,
                max_attempts = self.config.max_reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect probe"
            );
            tokio::time::sleep(delay).await;

            let state = self.state();
            if !state.is_online || state.is_service_reachable {
                break;
            }
            if let Some(result) = self.test_connection().await {
                if result.success {
                    break;
                }
            }
        }

        if !self.state().is_service_reachable {
            tracing::warn!(
                "Reconnect attempts exhausted, falling back to periodic probes"
            );
        }
        self.transition(|s| s.is_retrying = false);
    }

    async fn reconcile_if_pending(&self) -> Option<SyncResult> {
        match self.queue().is_empty() {
            Ok(true) => return None,
            Ok(false) => {}
            Err(e) => {
                tracing::error!("Failed to inspect offline queue: {}", e);
                return None;
            }
        }

        match self.reconciler.reconcile().await {
            Ok(result) => Some(result),
            Err(SyncError::InProgress) => {
                tracing::debug!("Reconciliation already running");
                None
            }
            Err(e) => {
                tracing::error!("Reconciliation failed: {}", e);
                self.sink.notify(Notice::Error {
                    message: e.to_string(),
                });
                None
            }
        }
    }
}

impl Drop for ConnectionStateMachine {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
    }
}
