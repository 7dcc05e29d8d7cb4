//! Events published to UI and persistence layers

use crate::analytics::AnalyticsSnapshot;
use crate::error::{Result, ShareError};
use crate::types::{CloseReason, Direction, PeerId, ProcessState, TransferMetadata};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::warn;

/// A chat message received from a peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub peer_id: PeerId,
    pub id: String,
    pub message: String,
    /// Sender's timestamp, Unix millis
    pub timestamp: u64,
}

/// Totals reported when an outbound transfer finishes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    pub transfer_id: String,
    pub peer_id: PeerId,
    pub bytes: u64,
    pub chunks: u32,
    pub retransmits: u32,
}

/// Everything the core reports to the outside
#[derive(Clone, Debug)]
pub enum ShareEvent {
    ConnectionOpened {
        peer_id: PeerId,
    },
    ConnectionClosed {
        peer_id: PeerId,
        reason: CloseReason,
    },
    PeerInfoUpdated {
        peer_id: PeerId,
        display_name: Option<String>,
    },
    ProcessStateChanged(ProcessState),
    TransferProgress {
        transfer_id: String,
        direction: Direction,
        bytes_confirmed: u64,
        total_bytes: u64,
        /// Bytes per second since the transfer started
        speed: f64,
    },
    TransferComplete {
        transfer_id: String,
        payload: Bytes,
        metadata: TransferMetadata,
    },
    TransferSent(TransferSummary),
    TransferError {
        transfer_id: String,
        direction: Direction,
        reason: ShareError,
    },
    ChatReceived(ChatEntry),
    AnalyticsSnapshot(AnalyticsSnapshot),
    SignalingRestored {
        attempts: u32,
    },
    SignalingUnavailable {
        attempts: u32,
    },
}

impl ShareEvent {
    /// Short name of the event
    pub fn name(&self) -> &'static str {
        match self {
            ShareEvent::ConnectionOpened { .. } => "connection-opened",
            ShareEvent::ConnectionClosed { .. } => "connection-closed",
            ShareEvent::PeerInfoUpdated { .. } => "peer-info-updated",
            ShareEvent::ProcessStateChanged(_) => "process-state-changed",
            ShareEvent::TransferProgress { .. } => "transfer-progress",
            ShareEvent::TransferComplete { .. } => "transfer-complete",
            ShareEvent::TransferSent(_) => "transfer-sent",
            ShareEvent::TransferError { .. } => "transfer-error",
            ShareEvent::ChatReceived(_) => "chat-received",
            ShareEvent::AnalyticsSnapshot(_) => "analytics-snapshot",
            ShareEvent::SignalingRestored { .. } => "signaling-restored",
            ShareEvent::SignalingUnavailable { .. } => "signaling-unavailable",
        }
    }
}

/// Observer for events, called synchronously on the emitting task
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &ShareEvent);
}

/// Fan-out of events to broadcast subscribers and registered sinks
pub struct EventBus {
    tx: broadcast::Sender<ShareEvent>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// New broadcast receiver
    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.tx.subscribe()
    }

    /// Register an observer
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        match self.sinks.write() {
            Ok(mut sinks) => sinks.push(sink),
            Err(e) => warn!("Event sink registry poisoned: {}", e),
        }
    }

    /// Publish an event
    pub fn emit(&self, event: ShareEvent) {
        if let Ok(sinks) = self.sinks.read() {
            for sink in sinks.iter() {
                sink.on_event(&event);
            }
        }
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

/// External store notified of completed transfers and removed peers
#[async_trait]
pub trait PersistenceHook: Send + Sync {
    /// A received file was reassembled and verified
    async fn transfer_completed(&self, metadata: &TransferMetadata, payload: &Bytes) -> Result<()>;

    /// A session was torn down
    async fn peer_removed(&self, _peer_id: &PeerId, _reason: &CloseReason) -> Result<()> {
        Ok(())
    }
}

/// Persistence hook that stores nothing
#[derive(Debug, Default)]
pub struct NoopPersistence;

#[async_trait]
impl PersistenceHook for NoopPersistence {
    async fn transfer_completed(&self, _metadata: &TransferMetadata, _payload: &Bytes) -> Result<()> {
        Ok(())
    }
}
