//! Fortune Sync Library
//!
//! Connectivity monitoring, health probing, bounded retries and an offline
//! write queue that is replayed once the backend is reachable again.

pub mod api;
pub mod cli;
pub mod config;
pub mod connection;
pub mod logger;
pub mod monitor;
pub mod notify;
pub mod probe;
pub mod queue;
pub mod retry;
pub mod store;
pub mod sync;
pub mod user_agent;

#[cfg(test)]
mod testing;

// Re-export commonly used types for easier access
pub use api::{BackendClient, BackendError, ErrorKind, HttpBackend};
pub use cli::Cli;
pub use config::Config;
pub use connection::{ConnectionConfig, ConnectionPhase, ConnectionState, ConnectionStateMachine};
pub use monitor::{ConnectivityMonitor, HostSignal, InterfaceWatcher};
pub use notify::{Notice, NotificationSink, Subscription};
pub use probe::{HealthProber, ProbeResult};
pub use queue::{OfflineQueue, OperationKind, QueuedOperation};
pub use retry::{RetryError, RetryExecutor, WriteOutcome};
pub use store::{AppSnapshot, LocalStore};
pub use sync::{PerformanceMetrics, SyncReconciler, SyncResult};
