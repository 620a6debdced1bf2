//! Host-level connectivity signals and their delivery to the state machine.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::Networks;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::connection::ConnectionStateMachine;
use crate::probe::ProbeResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    Online,
    Offline,
    /// The app came back to the foreground
    VisibilityRegained,
}

/// Forwards host signals to the state machine. Never mutates state itself.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    machine: Arc<ConnectionStateMachine>,
}

impl ConnectivityMonitor {
    pub fn new(machine: Arc<ConnectionStateMachine>) -> Self {
        Self { machine }
    }

    /// Offline is applied synchronously without a probe; online and
    /// visibility signals may probe.
    pub async fn handle(&self, signal: HostSignal) -> Option<ProbeResult> {
        tracing::debug!(?signal, "Host signal received");
        match signal {
            HostSignal::Offline => {
                self.machine.handle_host_offline();
                None
            }
            HostSignal::Online => self.machine.handle_host_online().await,
            HostSignal::VisibilityRegained => self.machine.handle_visibility_regained().await,
        }
    }

    /// Consume signals until the sender side is dropped or the machine goes
    /// away. The task only holds a weak reference and is registered with the
    /// machine so `stop()` aborts it.
    pub fn spawn(self, mut signals: mpsc::Receiver<HostSignal>) {
        let machine = Arc::downgrade(&self.machine);
        let task = tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(machine) = machine.upgrade() else {
                    break;
                };
                ConnectivityMonitor::new(machine).handle(signal).await;
            }
            tracing::debug!("Host signal monitor finished");
        });
        self.machine.track_task(task);
    }
}

/// Derives host online/offline signals by polling network interfaces.
pub struct InterfaceWatcher {
    poll_interval: Duration,
}

impl InterfaceWatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// True when any interface carries a routable address.
    pub fn host_is_online() -> bool {
        let networks = Networks::new_with_refreshed_list();
        has_routable_address(networks.list().values().flat_map(|data| {
            data.ip_networks()
                .iter()
                .map(|network| network.addr)
                .collect::<Vec<_>>()
        }))
    }

    /// Poll and emit a signal on every change. The first observation only
    /// emits when offline, since the machine starts optimistic.
    pub fn spawn(self, signals: mpsc::Sender<HostSignal>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last: Option<bool> = None;

            loop {
                ticker.tick().await;
                let online = match tokio::task::spawn_blocking(Self::host_is_online).await {
                    Ok(online) => online,
                    Err(e) => {
                        tracing::warn!("Interface poll failed: {}", e);
                        continue;
                    }
                };

                if last == Some(online) {
                    continue;
                }
                let first = last.is_none();
                last = Some(online);
                if first && online {
                    continue;
                }

                let signal = if online {
                    HostSignal::Online
                } else {
                    HostSignal::Offline
                };
                tracing::info!(?signal, "Host connectivity changed");
                if signals.send(signal).await.is_err() {
                    break;
                }
            }
        })
    }
}

fn is_routable(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => !(v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()),
        IpAddr::V6(v6) => {
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || link_local)
        }
    }
}

fn has_routable_address(addrs: impl IntoIterator<Item = IpAddr>) -> bool {
    addrs.into_iter().any(|addr| is_routable(&addr))
}
