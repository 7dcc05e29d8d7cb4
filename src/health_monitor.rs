//! Session liveness: periodic health checks and the dead-session sweep

use crate::config::ShareConfig;
use crate::connection_manager::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Drives heartbeat probes and the liveness sweep for all sessions
pub struct HealthMonitor {
    /// Connection manager reference
    manager: Arc<ConnectionManager>,
    /// Probe interval
    heartbeat_interval: Duration,
    /// Silence before a health check is sent
    soft_timeout: Duration,
    /// Silence before the session is torn down
    hard_timeout: Duration,
    /// Sweep interval
    sweep_interval: Duration,
}

impl HealthMonitor {
    /// Create new health monitor
    pub fn new(manager: Arc<ConnectionManager>, config: &ShareConfig) -> Self {
        Self {
            manager,
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            soft_timeout: Duration::from_secs(config.soft_timeout_secs),
            hard_timeout: Duration::from_secs(config.hard_timeout_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
        }
    }

    /// Start the monitoring loop, runs until `token` is cancelled
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut heartbeat = interval(self.heartbeat_interval);
            let mut sweep = interval(self.sweep_interval);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "Health monitor started (heartbeat: {:?}, sweep: {:?}, hard timeout: {:?})",
                self.heartbeat_interval, self.sweep_interval, self.hard_timeout
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = heartbeat.tick() => {
                        let probed = self.manager.heartbeat_tick(self.soft_timeout).await;
                        if probed > 0 {
                            debug!("Probed {} quiet peers", probed);
                        }
                    }
                    _ = sweep.tick() => {
                        let removed = self.manager.liveness_sweep(self.hard_timeout).await;
                        if removed > 0 {
                            info!("Liveness sweep removed {} sessions", removed);
                        }
                    }
                }
            }

            debug!("Health monitor stopped");
        })
    }
}
