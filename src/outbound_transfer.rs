//! Outbound transfer actor
//!
//! One task per outbound file. The offer and every chunk are tracked as units
//! in flight until the receiver acknowledges them. Unacknowledged units are
//! retransmitted with a doubling timeout until their retry budget runs out.

use crate::chunking::Chunk;
use crate::error::{Result, ShareError};
use crate::events::{EventBus, ShareEvent, TransferSummary};
use crate::transfer_engine::MessageSender;
use crate::types::{Direction, FileTransfer, TransferStatus};
use crate::wire::WireMessage;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Signals delivered to a running outbound transfer
#[derive(Clone, Debug, PartialEq)]
pub enum TransferSignal {
    /// Receiver has the offer
    OfferAck,
    /// Receiver stored chunk `seq`
    Ack(u32),
    /// Receiver asks for chunk `seq` again
    Retransmit(u32),
    /// Abort the transfer
    Cancel {
        reason: ShareError,
        /// Tell the receiver with `transfer-cancel`
        notify_peer: bool,
    },
}

/// Something the receiver must acknowledge
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Unit {
    Offer,
    Chunk(u32),
}

impl Unit {
    fn seq(self) -> u32 {
        match self {
            Unit::Offer => u32::MAX,
            Unit::Chunk(seq) => seq,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct InFlight {
    /// Retransmissions so far
    retries: u32,
    deadline: Instant,
}

/// Tuning for one outbound transfer
#[derive(Clone, Copy, Debug)]
pub struct OutboundLimits {
    pub max_in_flight: usize,
    pub ack_timeout: Duration,
    pub max_retries: u32,
}

/// Handle to a running outbound transfer
#[derive(Debug)]
pub struct TransferHandle {
    pub transfer_id: String,
    done: oneshot::Receiver<Result<TransferSummary>>,
}

impl TransferHandle {
    pub fn new(transfer_id: String, done: oneshot::Receiver<Result<TransferSummary>>) -> Self {
        Self { transfer_id, done }
    }

    /// Wait for the transfer to finish
    pub async fn wait(self) -> Result<TransferSummary> {
        self.done
            .await
            .map_err(|_| ShareError::Internal(format!("transfer {} task ended without result", self.transfer_id)))?
    }
}

/// Actor state of one outbound transfer
pub struct OutboundTransfer {
    transfer: FileTransfer,
    chunks: Vec<Chunk>,
    chunk_size: u32,
    sender: Arc<dyn MessageSender>,
    events: Arc<EventBus>,
    signals: mpsc::UnboundedReceiver<TransferSignal>,
    limits: OutboundLimits,
    in_flight: BTreeMap<Unit, InFlight>,
    /// Next chunk never sent
    next_seq: u32,
    offer_acked: bool,
    started: Instant,
}

impl OutboundTransfer {
    /// Create new outbound transfer
    pub fn new(
        transfer: FileTransfer,
        chunks: Vec<Chunk>,
        chunk_size: u32,
        sender: Arc<dyn MessageSender>,
        events: Arc<EventBus>,
        signals: mpsc::UnboundedReceiver<TransferSignal>,
        limits: OutboundLimits,
    ) -> Self {
        Self {
            transfer,
            chunks,
            chunk_size,
            sender,
            events,
            signals,
            limits,
            in_flight: BTreeMap::new(),
            next_seq: 0,
            offer_acked: false,
            started: Instant::now(),
        }
    }

    /// Drive the transfer to completion or failure, reporting either on the event bus
    pub async fn run(mut self) -> Result<TransferSummary> {
        let result = self.drive().await;
        match &result {
            Ok(summary) => {
                self.transfer.advance(TransferStatus::Completed);
                info!(
                    "Transfer {} to {} sent: {} bytes in {} chunks ({} retransmits)",
                    summary.transfer_id, summary.peer_id, summary.bytes, summary.chunks, summary.retransmits
                );
                self.events.emit(ShareEvent::TransferSent(summary.clone()));
            }
            Err(e) => {
                self.transfer.advance(TransferStatus::Error);
                warn!("Transfer {} to {} failed: {}", self.transfer.id, self.transfer.peer_id, e);
                self.events.emit(ShareEvent::TransferError {
                    transfer_id: self.transfer.id.clone(),
                    direction: Direction::Send,
                    reason: e.clone(),
                });
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<TransferSummary> {
        self.transfer.advance(TransferStatus::Transferring);
        self.transmit(Unit::Offer, 0).await?;
        self.fill_window().await?;

        while !self.is_done() {
            let deadline = self
                .in_flight
                .values()
                .map(|f| f.deadline)
                .min()
                .unwrap_or_else(|| Instant::now() + self.limits.ack_timeout);

            tokio::select! {
                signal = self.signals.recv() => match signal {
                    Some(signal) => self.on_signal(signal).await?,
                    None => return Err(ShareError::TransferCancelled("transfer engine stopped".to_string())),
                },
                _ = sleep_until(deadline) => self.on_timeouts().await?,
            }
        }

        Ok(TransferSummary {
            transfer_id: self.transfer.id.clone(),
            peer_id: self.transfer.peer_id.clone(),
            bytes: self.transfer.bytes_confirmed,
            chunks: self.chunks.len() as u32,
            retransmits: self.transfer.retransmits,
        })
    }

    fn is_done(&self) -> bool {
        self.offer_acked && self.transfer.is_fully_confirmed()
    }

    fn message_for(&self, unit: Unit) -> Option<WireMessage> {
        match unit {
            Unit::Offer => Some(WireMessage::FileOffer {
                transfer_id: self.transfer.id.clone(),
                name: self.transfer.name.clone(),
                size: self.transfer.size,
                mime_type: self.transfer.mime_type.clone(),
                total_chunks: self.chunks.len() as u32,
                chunk_size: self.chunk_size,
            }),
            Unit::Chunk(seq) => self.chunks.get(seq as usize).map(|chunk| WireMessage::FileChunk {
                transfer_id: self.transfer.id.clone(),
                seq,
                payload: chunk.payload.clone(),
                checksum: chunk.checksum.clone(),
            }),
        }
    }

    /// Send a unit and arm its ack timer
    async fn transmit(&mut self, unit: Unit, retries: u32) -> Result<()> {
        let message = self
            .message_for(unit)
            .ok_or_else(|| ShareError::Internal(format!("no chunk {} in {}", unit.seq(), self.transfer.id)))?;
        self.sender.send_message(&self.transfer.peer_id, &message).await?;

        let timeout = self.limits.ack_timeout.saturating_mul(1 << retries.min(16));
        self.in_flight.insert(
            unit,
            InFlight {
                retries,
                deadline: Instant::now() + timeout,
            },
        );
        Ok(())
    }

    /// Send new chunks while the window has room
    async fn fill_window(&mut self) -> Result<()> {
        let total = self.chunks.len() as u32;
        while self.next_seq < total && self.chunks_in_flight() < self.limits.max_in_flight {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.transmit(Unit::Chunk(seq), 0).await?;
        }
        Ok(())
    }

    fn chunks_in_flight(&self) -> usize {
        self.in_flight
            .keys()
            .filter(|unit| matches!(unit, Unit::Chunk(_)))
            .count()
    }

    async fn retransmit(&mut self, unit: Unit, retries: u32) -> Result<()> {
        if retries > self.limits.max_retries {
            return Err(ShareError::RetryBudgetExhausted(
                self.transfer.id.clone(),
                unit.seq(),
                self.limits.max_retries,
            ));
        }
        self.transfer.retransmits += 1;
        debug!(
            "Retransmitting {:?} of {} (retry {})",
            unit, self.transfer.id, retries
        );
        self.transmit(unit, retries).await
    }

    async fn on_signal(&mut self, signal: TransferSignal) -> Result<()> {
        match signal {
            TransferSignal::OfferAck => {
                if self.in_flight.remove(&Unit::Offer).is_some() {
                    debug!("Offer of {} acknowledged", self.transfer.id);
                }
                self.offer_acked = true;
            }
            TransferSignal::Ack(seq) => {
                let len = match self.chunks.get(seq as usize) {
                    Some(chunk) => chunk.len() as u64,
                    None => {
                        warn!("Ack for unknown chunk {} of {}", seq, self.transfer.id);
                        return Ok(());
                    }
                };
                self.in_flight.remove(&Unit::Chunk(seq));
                if self.transfer.confirm(seq, len) {
                    self.emit_progress();
                }
                self.fill_window().await?;
            }
            TransferSignal::Retransmit(seq) => {
                if let Some(flight) = self.in_flight.get(&Unit::Chunk(seq)).copied() {
                    warn!("Receiver rejected chunk {} of {}", seq, self.transfer.id);
                    self.retransmit(Unit::Chunk(seq), flight.retries + 1).await?;
                }
            }
            TransferSignal::Cancel { reason, notify_peer } => {
                if notify_peer {
                    let cancel = WireMessage::TransferCancel {
                        transfer_id: self.transfer.id.clone(),
                        reason: reason.to_string(),
                    };
                    if let Err(e) = self.sender.send_message(&self.transfer.peer_id, &cancel).await {
                        debug!("Could not send cancel for {}: {}", self.transfer.id, e);
                    }
                }
                return Err(reason);
            }
        }
        Ok(())
    }

    async fn on_timeouts(&mut self) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<(Unit, InFlight)> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.deadline <= now)
            .map(|(unit, flight)| (*unit, *flight))
            .collect();

        for (unit, flight) in expired {
            if let Err(e) = self.retransmit(unit, flight.retries + 1).await {
                if matches!(e, ShareError::RetryBudgetExhausted(..)) {
                    let cancel = WireMessage::TransferCancel {
                        transfer_id: self.transfer.id.clone(),
                        reason: e.to_string(),
                    };
                    let _ = self.sender.send_message(&self.transfer.peer_id, &cancel).await;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn emit_progress(&self) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            self.transfer.bytes_confirmed as f64 / elapsed
        } else {
            0.0
        };
        self.events.emit(ShareEvent::TransferProgress {
            transfer_id: self.transfer.id.clone(),
            direction: Direction::Send,
            bytes_confirmed: self.transfer.bytes_confirmed,
            total_bytes: self.transfer.size,
            speed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::split_into_chunks;
    use crate::types::PeerId;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;

    /// Records every message instead of sending it
    #[derive(Default)]
    struct Recorder(Mutex<Vec<WireMessage>>);

    impl Recorder {
        fn chunk_sends(&self, wanted: u32) -> usize {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|m| matches!(m, WireMessage::FileChunk { seq, .. } if *seq == wanted))
                .count()
        }

        fn count(&self, kind: &str) -> usize {
            self.0.lock().unwrap().iter().filter(|m| m.kind() == kind).count()
        }
    }

    #[async_trait]
    impl MessageSender for Recorder {
        async fn send_message(&self, _peer_id: &PeerId, message: &WireMessage) -> Result<()> {
            self.0.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn setup(
        len: usize,
        max_in_flight: usize,
    ) -> (OutboundTransfer, Arc<Recorder>, mpsc::UnboundedSender<TransferSignal>) {
        let data = Bytes::from(vec![7u8; len]);
        let chunks = split_into_chunks(&data, 1024);
        let mut transfer = FileTransfer::new("t-1".into(), PeerId::parse("BBBB0001").unwrap(), Direction::Send);
        transfer.name = "a.bin".into();
        transfer.size = len as u64;
        transfer.total_chunks = Some(chunks.len() as u32);
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = OutboundTransfer::new(
            transfer,
            chunks,
            1024,
            recorder.clone(),
            Arc::new(EventBus::new(64)),
            rx,
            OutboundLimits {
                max_in_flight,
                ack_timeout: Duration::from_secs(1),
                max_retries: 4,
            },
        );
        (actor, recorder, tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_limits_in_flight_chunks() {
        let (actor, recorder, tx) = setup(10 * 1024, 4);
        let task = tokio::spawn(actor.run());
        tokio::task::yield_now().await;

        assert_eq!(recorder.count("file-offer"), 1);
        assert_eq!(recorder.count("file-chunk"), 4);

        tx.send(TransferSignal::OfferAck).unwrap();
        for seq in 0..10 {
            tx.send(TransferSignal::Ack(seq)).unwrap();
            tokio::task::yield_now().await;
        }

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.chunks, 10);
        assert_eq!(summary.bytes, 10 * 1024);
        assert_eq!(summary.retransmits, 0);
        assert_eq!(recorder.count("file-chunk"), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let (actor, recorder, tx) = setup(1024, 16);
        tx.send(TransferSignal::OfferAck).unwrap();

        let started = Instant::now();
        let err = actor.run().await.unwrap_err();
        assert_eq!(err, ShareError::RetryBudgetExhausted("t-1".into(), 0, 4));

        // 1 + 2 + 4 + 8 + 16 seconds of waiting
        assert!(started.elapsed() >= Duration::from_secs(31));
        assert!(started.elapsed() < Duration::from_secs(32));
        assert_eq!(recorder.chunk_sends(0), 5);
        assert_eq!(recorder.count("transfer-cancel"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmit_request_is_immediate() {
        let (actor, recorder, tx) = setup(2048, 16);
        let task = tokio::spawn(actor.run());
        tokio::task::yield_now().await;

        tx.send(TransferSignal::Retransmit(1)).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(recorder.chunk_sends(1), 2);

        tx.send(TransferSignal::OfferAck).unwrap();
        tx.send(TransferSignal::Ack(0)).unwrap();
        tx.send(TransferSignal::Ack(1)).unwrap();
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.retransmits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_notifies_peer() {
        let (actor, recorder, tx) = setup(2048, 16);
        tx.send(TransferSignal::Cancel {
            reason: ShareError::TransferCancelled("user".into()),
            notify_peer: true,
        })
        .unwrap();
        let err = actor.run().await.unwrap_err();
        assert_eq!(err, ShareError::TransferCancelled("user".into()));
        assert_eq!(recorder.count("transfer-cancel"), 1);
    }

    #[tokio::test]
    async fn test_handle_reports_dropped_task() {
        let (tx, rx) = oneshot::channel::<Result<TransferSummary>>();
        drop(tx);
        let handle = TransferHandle::new("t-9".into(), rx);
        assert!(matches!(handle.wait().await, Err(ShareError::Internal(_))));
    }
}
