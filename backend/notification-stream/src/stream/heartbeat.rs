/// Liveness monitor
///
/// One recurring timer per stream service. Every tick:
/// 1. pings every connection; a sink that accepts the ping counts as alive
/// 2. evicts connections whose last liveness is older than the timeout
///
/// Ping runs before eviction so a connection always gets one more chance on
/// the tick that would otherwise evict it.
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::dispatcher::Dispatcher;
use super::registry::ConnectionRegistry;
use crate::metrics;

/// Outcome of one heartbeat tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub pinged: usize,
    pub refreshed: usize,
    pub evicted: usize,
}

pub struct HeartbeatMonitor {
    registry: Arc<RwLock<ConnectionRegistry>>,
    dispatcher: Dispatcher,
    ping_interval: Duration,
    liveness_timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<RwLock<ConnectionRegistry>>,
        ping_interval: Duration,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(registry.clone()),
            registry,
            ping_interval,
            liveness_timeout,
        }
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    /// Run one ping + eviction pass as of `now`
    pub fn tick(&self, now: Instant) -> TickReport {
        let (ping, alive) = self.dispatcher.ping_all();

        let evicted = {
            let mut registry = self.registry.write();
            registry.refresh_liveness(&alive, now);
            registry.remove_stale(now, self.liveness_timeout)
        };

        for connection in &evicted {
            connection.close();
            tracing::warn!(
                connection_id = %connection.id(),
                user_id = %connection.user_id(),
                idle_secs = now.saturating_duration_since(connection.last_liveness_at()).as_secs(),
                "Evicting stale notification stream"
            );
        }

        if !evicted.is_empty() {
            metrics::record_evictions(evicted.len());
        }

        TickReport {
            pinged: ping.matched,
            refreshed: alive.len(),
            evicted: evicted.len(),
        }
    }

    /// Start the recurring timer on the current tokio runtime
    ///
    /// The first tick fires one interval after start.
    pub fn spawn(self) -> HeartbeatHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                ping_interval_secs = self.ping_interval.as_secs(),
                liveness_timeout_secs = self.liveness_timeout.as_secs(),
                "Heartbeat monitor started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Heartbeat monitor shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = self.tick(Instant::now());
                        tracing::debug!(
                            pinged = report.pinged,
                            refreshed = report.refreshed,
                            evicted = report.evicted,
                            "Heartbeat tick"
                        );
                    }
                }
            }
        });

        HeartbeatHandle {
            shutdown_tx,
            handle,
        }
    }
}

/// Owner of the running heartbeat timer; dropping it stops the timer
pub struct HeartbeatHandle {
    shutdown_tx: watch::Sender<()>,
    handle: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        self.handle.abort();
    }
}
