//! Transfer analytics: cumulative counters, speed sampling and connection history
//!
//! The aggregator is an [`EventSink`]: it learns about connections and
//! transfers from the events the other components publish. Changes only mark
//! the state dirty; a timer publishes at most one snapshot per debounce
//! interval.

use crate::config::ShareConfig;
use crate::events::{EventBus, EventSink, ShareEvent};
use crate::types::{now_millis, Direction, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Kind of connection-history entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEventKind {
    Opened,
    Closed,
}

/// One connection-history entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub peer_id: PeerId,
    pub kind: ConnectionEventKind,
    /// Close reason, if closed
    pub reason: Option<String>,
    /// Unix millis
    pub timestamp: u64,
}

/// Published analytics state
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub files_sent: u64,
    pub files_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Bytes per second over the last sample
    pub current_speed: f64,
    /// Mean of the recent samples
    pub average_speed: f64,
    /// Transfers with progress but no outcome yet
    pub active_transfers: usize,
    /// Oldest first
    pub connection_history: Vec<ConnectionRecord>,
}

struct AnalyticsState {
    files_sent: u64,
    files_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    /// Last confirmed byte count per transfer
    confirmed: HashMap<String, u64>,
    /// Bytes confirmed since the last sample
    window_bytes: u64,
    last_sample: Instant,
    current_speed: f64,
    samples: VecDeque<f64>,
    history: VecDeque<ConnectionRecord>,
    dirty: bool,
}

/// Aggregates transfer and connection analytics
pub struct AnalyticsAggregator {
    state: Mutex<AnalyticsState>,
    sample_interval: Duration,
    window_samples: usize,
    history_limit: usize,
    debounce: Duration,
}

impl AnalyticsAggregator {
    /// Create new analytics aggregator
    pub fn new(config: &ShareConfig) -> Self {
        Self {
            state: Mutex::new(AnalyticsState {
                files_sent: 0,
                files_received: 0,
                bytes_sent: 0,
                bytes_received: 0,
                confirmed: HashMap::new(),
                window_bytes: 0,
                last_sample: Instant::now(),
                current_speed: 0.0,
                samples: VecDeque::new(),
                history: VecDeque::new(),
                dirty: false,
            }),
            sample_interval: Duration::from_millis(config.speed_sample_interval_ms),
            window_samples: config.speed_window_samples,
            history_limit: config.connection_history_limit,
            debounce: Duration::from_millis(config.analytics_debounce_ms),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut AnalyticsState) -> R) -> Option<R> {
        match self.state.lock() {
            Ok(mut state) => Some(f(&mut state)),
            Err(e) => {
                warn!("Analytics state poisoned: {}", e);
                None
            }
        }
    }

    fn record_connection(&self, peer_id: &PeerId, kind: ConnectionEventKind, reason: Option<String>) {
        let limit = self.history_limit;
        self.with_state(|state| {
            if state.history.len() >= limit {
                state.history.pop_front();
            }
            state.history.push_back(ConnectionRecord {
                peer_id: peer_id.clone(),
                kind,
                reason,
                timestamp: now_millis(),
            });
            state.dirty = true;
        });
    }

    fn record_progress(&self, transfer_id: &str, direction: Direction, bytes_confirmed: u64) {
        self.with_state(|state| {
            let previous = state.confirmed.insert(transfer_id.to_string(), bytes_confirmed).unwrap_or(0);
            let delta = bytes_confirmed.saturating_sub(previous);
            match direction {
                Direction::Send => state.bytes_sent += delta,
                Direction::Receive => state.bytes_received += delta,
            }
            state.window_bytes += delta;
            state.dirty = true;
        });
        self.sample(Instant::now());
    }

    fn record_finished(&self, transfer_id: &str, direction: Option<Direction>) {
        self.with_state(|state| {
            state.confirmed.remove(transfer_id);
            match direction {
                Some(Direction::Send) => state.files_sent += 1,
                Some(Direction::Receive) => state.files_received += 1,
                None => {}
            }
            state.dirty = true;
        });
    }

    /// Take a speed sample if the sampling interval has passed
    fn sample(&self, now: Instant) {
        let interval = self.sample_interval;
        let window = self.window_samples;
        self.with_state(|state| {
            let elapsed = now.saturating_duration_since(state.last_sample);
            if elapsed < interval {
                return;
            }
            let speed = state.window_bytes as f64 / elapsed.as_secs_f64();
            if speed != state.current_speed {
                state.dirty = true;
            }
            state.current_speed = speed;
            state.window_bytes = 0;
            state.last_sample = now;
            if state.samples.len() >= window {
                state.samples.pop_front();
            }
            state.samples.push_back(speed);
        });
    }

    /// Current state
    pub fn snapshot(&self) -> AnalyticsSnapshot {
        self.with_state(|state| Self::build_snapshot(state))
            .unwrap_or_default()
    }

    fn build_snapshot(state: &AnalyticsState) -> AnalyticsSnapshot {
        let average_speed = if state.samples.is_empty() {
            0.0
        } else {
            state.samples.iter().sum::<f64>() / state.samples.len() as f64
        };
        AnalyticsSnapshot {
            files_sent: state.files_sent,
            files_received: state.files_received,
            bytes_sent: state.bytes_sent,
            bytes_received: state.bytes_received,
            current_speed: state.current_speed,
            average_speed,
            active_transfers: state.confirmed.len(),
            connection_history: state.history.iter().cloned().collect(),
        }
    }

    /// Snapshot if anything changed since the last call
    pub fn take_dirty(&self) -> Option<AnalyticsSnapshot> {
        self.sample(Instant::now());
        self.with_state(|state| {
            if !state.dirty {
                return None;
            }
            state.dirty = false;
            Some(Self::build_snapshot(state))
        })
        .flatten()
    }

    /// Publish snapshots every debounce interval while something changes
    pub fn spawn_flush(self: &Arc<Self>, bus: Arc<EventBus>, token: CancellationToken) -> JoinHandle<()> {
        let analytics = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(analytics.debounce);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(snapshot) = analytics.take_dirty() {
                            bus.emit(ShareEvent::AnalyticsSnapshot(snapshot));
                        }
                    }
                }
            }
            debug!("Analytics flush stopped");
        })
    }
}

impl EventSink for AnalyticsAggregator {
    fn on_event(&self, event: &ShareEvent) {
        match event {
            ShareEvent::ConnectionOpened { peer_id } => {
                self.record_connection(peer_id, ConnectionEventKind::Opened, None)
            }
            ShareEvent::ConnectionClosed { peer_id, reason } => {
                self.record_connection(peer_id, ConnectionEventKind::Closed, Some(reason.to_string()))
            }
            ShareEvent::TransferProgress {
                transfer_id,
                direction,
                bytes_confirmed,
                ..
            } => self.record_progress(transfer_id, *direction, *bytes_confirmed),
            ShareEvent::TransferSent(summary) => {
                self.record_finished(&summary.transfer_id, Some(Direction::Send))
            }
            ShareEvent::TransferComplete { transfer_id, .. } => {
                self.record_finished(transfer_id, Some(Direction::Receive))
            }
            ShareEvent::TransferError { transfer_id, .. } => self.record_finished(transfer_id, None),
            _ => {}
        }
    }
}
