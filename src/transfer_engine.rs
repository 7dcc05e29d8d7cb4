//! Chunked transfer protocol engine
//!
//! Outbound files run as [`OutboundTransfer`] actors addressed through a
//! `DashMap` of signal senders. Inbound state lives in [`InboundTransfers`].

use crate::chunking::split_into_chunks;
use crate::config::ShareConfig;
use crate::connection_manager::ConnectionManager;
use crate::error::{Result, ShareError};
use crate::events::{EventBus, PersistenceHook};
use crate::inbound_transfer::InboundTransfers;
use crate::outbound_transfer::{OutboundLimits, OutboundTransfer, TransferHandle, TransferSignal};
use crate::types::{CloseReason, Direction, FileTransfer, PeerId};
use crate::wire::WireMessage;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Outbound path to a peer
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(&self, peer_id: &PeerId, message: &WireMessage) -> Result<()>;
}

#[async_trait]
impl MessageSender for ConnectionManager {
    async fn send_message(&self, peer_id: &PeerId, message: &WireMessage) -> Result<()> {
        self.send(peer_id, message).await
    }
}

/// Mailbox of a running outbound transfer
struct OutboundEntry {
    peer_id: PeerId,
    signals: mpsc::UnboundedSender<TransferSignal>,
}

/// Runs every transfer of the node
pub struct TransferEngine {
    config: ShareConfig,
    manager: Arc<ConnectionManager>,
    events: Arc<EventBus>,
    outbound: Arc<DashMap<String, OutboundEntry>>,
    inbound: InboundTransfers,
}

impl TransferEngine {
    /// Create new transfer engine
    pub fn new(
        config: ShareConfig,
        manager: Arc<ConnectionManager>,
        events: Arc<EventBus>,
        persistence: Arc<dyn PersistenceHook>,
    ) -> Self {
        let inbound = InboundTransfers::new(
            manager.clone(),
            events.clone(),
            persistence,
            config.max_protocol_violations,
            config.max_in_flight_chunks,
        );
        Self {
            config,
            manager,
            events,
            outbound: Arc::new(DashMap::new()),
            inbound,
        }
    }

    /// Start sending a file to a connected peer
    pub fn send_file(
        &self,
        peer_id: &PeerId,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: Bytes,
    ) -> Result<TransferHandle> {
        if !self.manager.is_connected(peer_id) {
            return Err(ShareError::PeerNotConnected(peer_id.to_string()));
        }

        let transfer_id = uuid::Uuid::new_v4().to_string();
        let chunks = split_into_chunks(&data, self.config.chunk_size);

        let mut transfer = FileTransfer::new(transfer_id.clone(), peer_id.clone(), Direction::Send);
        transfer.name = name.into();
        transfer.mime_type = mime_type.into();
        transfer.size = data.len() as u64;
        transfer.total_chunks = Some(chunks.len() as u32);

        info!(
            "Sending {} to {}: {} ({} bytes, {} chunks)",
            transfer_id,
            peer_id,
            transfer.name,
            transfer.size,
            chunks.len()
        );

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let actor = OutboundTransfer::new(
            transfer,
            chunks,
            self.config.chunk_size as u32,
            self.manager.clone(),
            self.events.clone(),
            signal_rx,
            OutboundLimits {
                max_in_flight: self.config.max_in_flight_chunks,
                ack_timeout: self.config.chunk_ack_timeout(),
                max_retries: self.config.max_chunk_retries,
            },
        );
        self.outbound.insert(
            transfer_id.clone(),
            OutboundEntry {
                peer_id: peer_id.clone(),
                signals: signal_tx,
            },
        );

        let (done_tx, done_rx) = oneshot::channel();
        let table = self.outbound.clone();
        let id = transfer_id.clone();
        tokio::spawn(async move {
            let result = actor.run().await;
            table.remove(&id);
            let _ = done_tx.send(result);
        });

        Ok(TransferHandle::new(transfer_id, done_rx))
    }

    /// Cancel a running outbound transfer, returns false if it is unknown
    pub fn cancel(&self, transfer_id: &str, reason: &str) -> bool {
        self.signal(
            None,
            transfer_id,
            TransferSignal::Cancel {
                reason: ShareError::TransferCancelled(reason.to_string()),
                notify_peer: true,
            },
        )
    }

    /// Deliver a signal to an outbound actor owned by `from` (any owner when `None`)
    fn signal(&self, from: Option<&PeerId>, transfer_id: &str, signal: TransferSignal) -> bool {
        let entry = match self.outbound.get(transfer_id) {
            Some(entry) => entry,
            None => {
                debug!("Signal for unknown transfer {}", transfer_id);
                return false;
            }
        };
        if let Some(from) = from {
            if entry.peer_id != *from {
                warn!(
                    "Ignoring {:?} for {} from {}, not the transfer's peer",
                    signal, transfer_id, from
                );
                return false;
            }
        }
        entry.signals.send(signal).is_ok()
    }

    /// Handle a transfer message, returns false if it is not one
    pub async fn handle_message(&self, peer_id: &PeerId, message: WireMessage) -> bool {
        match message {
            WireMessage::FileOffer {
                transfer_id,
                name,
                size,
                mime_type,
                total_chunks,
                chunk_size,
            } => {
                self.inbound
                    .on_offer(peer_id, &transfer_id, name, size, mime_type, total_chunks, chunk_size)
                    .await;
            }
            WireMessage::FileChunk {
                transfer_id,
                seq,
                payload,
                checksum,
            } => {
                self.inbound
                    .on_chunk(peer_id, &transfer_id, seq, payload, checksum)
                    .await;
            }
            WireMessage::FileOfferAck { transfer_id } => {
                self.signal(Some(peer_id), &transfer_id, TransferSignal::OfferAck);
            }
            WireMessage::ChunkAck { transfer_id, seq } => {
                self.signal(Some(peer_id), &transfer_id, TransferSignal::Ack(seq));
            }
            WireMessage::ChunkRetransmit { transfer_id, seq } => {
                self.signal(Some(peer_id), &transfer_id, TransferSignal::Retransmit(seq));
            }
            WireMessage::TransferCancel { transfer_id, reason } => {
                let outbound = self.signal(
                    Some(peer_id),
                    &transfer_id,
                    TransferSignal::Cancel {
                        reason: ShareError::TransferCancelled(format!("cancelled by receiver: {}", reason)),
                        notify_peer: false,
                    },
                );
                if !outbound {
                    self.inbound.on_remote_cancel(peer_id, &transfer_id, &reason).await;
                }
            }
            _ => return false,
        }
        true
    }

    /// Fail everything bound to a closed session
    pub async fn session_closed(&self, peer_id: &PeerId, reason: &CloseReason) {
        let reason = format!("session closed: {}", reason);
        let outbound: Vec<String> = self
            .outbound
            .iter()
            .filter(|e| e.peer_id == *peer_id)
            .map(|e| e.key().clone())
            .collect();
        for transfer_id in &outbound {
            self.signal(
                Some(peer_id),
                transfer_id,
                TransferSignal::Cancel {
                    reason: ShareError::TransferCancelled(reason.clone()),
                    notify_peer: false,
                },
            );
        }

        let inbound = self.inbound.cancel_peer(peer_id, &reason).await;
        if !outbound.is_empty() || inbound > 0 {
            info!(
                "Cancelled {} outbound and {} inbound transfers of {}",
                outbound.len(),
                inbound,
                peer_id
            );
        }
    }

    /// Expire inbound transfers without progress
    pub async fn expire_stalled(&self) -> usize {
        self.inbound
            .expire_stalled(Duration::from_secs(self.config.inbound_idle_timeout_secs))
            .await
    }

    pub fn active_outbound(&self) -> usize {
        self.outbound.len()
    }

    pub fn active_inbound(&self) -> usize {
        self.inbound.active_count()
    }
}
