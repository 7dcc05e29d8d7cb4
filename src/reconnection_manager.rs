//! Signaling link recovery with exponential backoff

use crate::config::ShareConfig;
use crate::error::{Result, ShareError};
use crate::events::{EventBus, ShareEvent};
use crate::transport::SignalingProvider;
use crate::types::BackoffState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Re-establishes the signaling link after it dropped
pub struct ReconnectionManager {
    provider: Arc<dyn SignalingProvider>,
    events: Arc<EventBus>,
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    /// Set while a recovery loop runs
    in_progress: AtomicBool,
}

impl ReconnectionManager {
    /// Create a new reconnection manager
    pub fn new(provider: Arc<dyn SignalingProvider>, events: Arc<EventBus>, config: &ShareConfig) -> Self {
        Self {
            provider,
            events,
            base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            max_delay: Duration::from_secs(config.max_reconnect_delay_secs),
            max_attempts: config.max_reconnect_attempts,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Fresh backoff schedule
    pub fn backoff(&self) -> BackoffState {
        BackoffState::new(self.base_delay, self.max_delay, self.max_attempts)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Start a recovery loop unless one is already running
    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> Option<JoinHandle<Result<u32>>> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return None;
        }
        let manager = self.clone();
        Some(tokio::spawn(async move {
            let result = manager.run(token).await;
            manager.in_progress.store(false, Ordering::SeqCst);
            result
        }))
    }

    /// Retry `reconnect` with backoff, returns the attempts it took
    async fn run(&self, token: CancellationToken) -> Result<u32> {
        let mut backoff = self.backoff();
        warn!("Signaling link lost, reconnecting");

        loop {
            let delay = match backoff.next_delay() {
                Some(delay) => delay,
                None => {
                    error!(
                        "Signaling unavailable after {} attempts",
                        backoff.failed_attempts
                    );
                    self.events.emit(ShareEvent::SignalingUnavailable {
                        attempts: backoff.failed_attempts,
                    });
                    return Err(ShareError::Transport(format!(
                        "signaling unavailable after {} attempts",
                        backoff.failed_attempts
                    )));
                }
            };

            warn!(
                "Reconnecting signaling in {}ms (attempt {})",
                delay.as_millis(),
                backoff.failed_attempts
            );
            tokio::select! {
                _ = token.cancelled() => return Err(ShareError::Shutdown),
                _ = sleep(delay) => {}
            }

            match self.provider.reconnect().await {
                Ok(()) => {
                    info!("Signaling restored after {} attempts", backoff.failed_attempts);
                    self.events.emit(ShareEvent::SignalingRestored {
                        attempts: backoff.failed_attempts,
                    });
                    return Ok(backoff.failed_attempts);
                }
                Err(e) => warn!("Signaling reconnect attempt {} failed: {}", backoff.failed_attempts, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use crate::types::PeerId;

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let net = MemoryNetwork::new();
        let (signaling, _incoming) = net.register(PeerId::parse("AAAA0001").unwrap());
        signaling.set_link_up(false);
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let manager = Arc::new(ReconnectionManager::new(signaling, bus, &ShareConfig::new("AAAA0001")));

        let started = tokio::time::Instant::now();
        let handle = manager.spawn(CancellationToken::new()).unwrap();
        assert!(manager.spawn(CancellationToken::new()).is_none());
        assert!(handle.await.unwrap().is_err());

        // 1.2 + 2.4 + 4.8 + 9.6 + 19.2 + 30 seconds at the least
        assert!(started.elapsed() >= Duration::from_millis(67_200));
        assert!(!manager.is_reconnecting());
        assert!(matches!(
            rx.recv().await.unwrap(),
            ShareEvent::SignalingUnavailable { attempts: 6 }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restores_when_link_returns() {
        let net = MemoryNetwork::new();
        let (signaling, _incoming) = net.register(PeerId::parse("AAAA0001").unwrap());
        signaling.set_link_up(false);
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let manager = Arc::new(ReconnectionManager::new(signaling.clone(), bus, &ShareConfig::new("AAAA0001")));

        let handle = manager.spawn(CancellationToken::new()).unwrap();
        // First attempt lands before 1.5s, the second after 3.6s
        tokio::time::sleep(Duration::from_secs(2)).await;
        signaling.set_link_up(true);

        assert_eq!(handle.await.unwrap().unwrap(), 2);
        assert!(matches!(
            rx.recv().await.unwrap(),
            ShareEvent::SignalingRestored { attempts: 2 }
        ));
    }
}
