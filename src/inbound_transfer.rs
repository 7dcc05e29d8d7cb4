//! Inbound transfers: verification, acknowledgement and reassembly

use crate::chunking::{chunk_count, Chunk, ReassemblyBuffer};
use crate::error::ShareError;
use crate::events::{EventBus, PersistenceHook, ShareEvent};
use crate::transfer_engine::MessageSender;
use crate::types::{Direction, FileTransfer, PeerId, TransferStatus};
use crate::wire::WireMessage;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type TransferKey = (PeerId, String);

/// State of one transfer being received
struct InboundState {
    transfer: FileTransfer,
    buffer: ReassemblyBuffer,
    /// Out-of-range chunks seen
    violations: u32,
    last_activity: Instant,
    started: Instant,
}

impl InboundState {
    fn new(peer_id: PeerId, transfer_id: &str, early_limit: usize) -> Self {
        let now = Instant::now();
        Self {
            transfer: FileTransfer::new(transfer_id.to_string(), peer_id, Direction::Receive),
            buffer: ReassemblyBuffer::with_early_limit(transfer_id, early_limit),
            violations: 0,
            last_activity: now,
            started: now,
        }
    }

    fn progress_event(&self) -> ShareEvent {
        let elapsed = self.started.elapsed().as_secs_f64();
        let bytes = self.buffer.received_bytes();
        ShareEvent::TransferProgress {
            transfer_id: self.transfer.id.clone(),
            direction: Direction::Receive,
            bytes_confirmed: bytes,
            total_bytes: self.transfer.size,
            speed: if elapsed > 0.0 { bytes as f64 / elapsed } else { 0.0 },
        }
    }
}

/// How a transfer left the active table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Settled {
    Delivered,
    Failed,
}

/// What to do after a chunk was looked at under the table lock
enum ChunkOutcome {
    /// Acks wait for the offer
    Accepted { progress: ShareEvent, complete: bool, ack: bool },
    Duplicate { ack: bool },
    Violation(ShareError, bool),
    Finished(Settled),
}

/// Table of inbound transfers keyed by (peer, transfer id)
pub struct InboundTransfers {
    active: DashMap<TransferKey, InboundState>,
    /// Recently settled transfers; late traffic of delivered ones is re-acknowledged,
    /// late traffic of failed ones is answered with a cancel
    finished: DashMap<TransferKey, (Instant, Settled)>,
    sender: Arc<dyn MessageSender>,
    events: Arc<EventBus>,
    persistence: Arc<dyn PersistenceHook>,
    max_violations: u32,
    /// Chunks held per transfer before its offer
    max_early_chunks: usize,
}

impl InboundTransfers {
    /// Create new inbound transfer table
    pub fn new(
        sender: Arc<dyn MessageSender>,
        events: Arc<EventBus>,
        persistence: Arc<dyn PersistenceHook>,
        max_violations: u32,
        max_early_chunks: usize,
    ) -> Self {
        Self {
            active: DashMap::new(),
            finished: DashMap::new(),
            sender,
            events,
            persistence,
            max_violations,
            max_early_chunks,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Chunks accepted so far for a transfer
    pub fn received_chunks(&self, peer_id: &PeerId, transfer_id: &str) -> Option<usize> {
        self.active
            .get(&(peer_id.clone(), transfer_id.to_string()))
            .map(|s| s.buffer.received_count())
    }

    async fn reply(&self, peer_id: &PeerId, message: WireMessage) {
        if let Err(e) = self.sender.send_message(peer_id, &message).await {
            debug!("Failed to send {} to {}: {}", message.kind(), peer_id, e);
        }
    }

    fn settled(&self, key: &TransferKey) -> Option<Settled> {
        self.finished.get(key).map(|entry| entry.1)
    }

    fn settle(&self, key: &TransferKey, settled: Settled) {
        self.finished.insert(key.clone(), (Instant::now(), settled));
    }

    /// Tell the sender again that a transfer failed here
    async fn refuse(&self, peer_id: &PeerId, transfer_id: &str) {
        debug!("Refusing traffic for failed transfer {} from {}", transfer_id, peer_id);
        self.reply(
            peer_id,
            WireMessage::TransferCancel {
                transfer_id: transfer_id.to_string(),
                reason: "transfer already failed".to_string(),
            },
        )
        .await;
    }

    /// Handle a `file-offer`
    #[allow(clippy::too_many_arguments)]
    pub async fn on_offer(
        &self,
        peer_id: &PeerId,
        transfer_id: &str,
        name: String,
        size: u64,
        mime_type: String,
        total_chunks: u32,
        chunk_size: u32,
    ) {
        let key = (peer_id.clone(), transfer_id.to_string());
        match self.settled(&key) {
            Some(Settled::Delivered) => {
                self.reply(peer_id, WireMessage::FileOfferAck { transfer_id: transfer_id.to_string() })
                    .await;
                return;
            }
            Some(Settled::Failed) => {
                self.refuse(peer_id, transfer_id).await;
                return;
            }
            None => {}
        }

        if chunk_size == 0 || chunk_count(size, chunk_size as usize) != total_chunks {
            let err = ShareError::SizeViolation(
                transfer_id.to_string(),
                u64::from(total_chunks) * u64::from(chunk_size),
                size,
            );
            self.fail(peer_id, transfer_id, err, true).await;
            return;
        }

        let (evicted, held, complete) = {
            let mut state = self
                .active
                .entry(key.clone())
                .or_insert_with(|| InboundState::new(peer_id.clone(), transfer_id, self.max_early_chunks));
            state.last_activity = Instant::now();

            if state.buffer.has_header() {
                (Vec::new(), Vec::new(), false)
            } else {
                state.transfer.name = name;
                state.transfer.size = size;
                state.transfer.mime_type = mime_type;
                state.transfer.total_chunks = Some(total_chunks);
                state.transfer.advance(TransferStatus::Transferring);
                let evicted = state.buffer.set_header(total_chunks, size, chunk_size);
                state.violations += evicted.len() as u32;
                info!(
                    "Receiving {} from {}: {} ({} bytes, {} chunks)",
                    transfer_id, peer_id, state.transfer.name, size, total_chunks
                );
                (evicted, state.buffer.received_seqs(), state.buffer.is_complete())
            }
        };

        self.reply(peer_id, WireMessage::FileOfferAck { transfer_id: transfer_id.to_string() })
            .await;
        // Chunks that arrived ahead of the offer
        for seq in held {
            self.reply(peer_id, WireMessage::ChunkAck { transfer_id: transfer_id.to_string(), seq })
                .await;
        }

        if !evicted.is_empty() {
            warn!(
                "Dropped {} chunks of {} outside the announced range",
                evicted.len(),
                transfer_id
            );
            let over_limit = self
                .active
                .get(&key)
                .map(|s| s.violations > self.max_violations)
                .unwrap_or(false);
            if over_limit {
                let err = ShareError::SequenceOutOfRange(transfer_id.to_string(), evicted[0], total_chunks);
                self.fail(peer_id, transfer_id, err, true).await;
                return;
            }
        }

        if complete {
            self.complete(&key).await;
        }
    }

    /// Handle a `file-chunk`
    pub async fn on_chunk(&self, peer_id: &PeerId, transfer_id: &str, seq: u32, payload: Bytes, checksum: String) {
        let key = (peer_id.clone(), transfer_id.to_string());

        // Verified before any table lock is taken
        let verified = match (Chunk { seq, payload, checksum }).verify(transfer_id) {
            Ok(verified) => verified,
            Err(e) => {
                warn!("{} from {}, requesting retransmit", e, peer_id);
                self.reply(
                    peer_id,
                    WireMessage::ChunkRetransmit { transfer_id: transfer_id.to_string(), seq },
                )
                .await;
                return;
            }
        };

        let outcome = if let Some(settled) = self.settled(&key) {
            ChunkOutcome::Finished(settled)
        } else {
            let mut state = self
                .active
                .entry(key.clone())
                .or_insert_with(|| InboundState::new(peer_id.clone(), transfer_id, self.max_early_chunks));
            state.last_activity = Instant::now();
            let ack = state.buffer.has_header();

            if state.buffer.contains(seq) {
                ChunkOutcome::Duplicate { ack }
            } else {
                let len = verified.len() as u64;
                match state.buffer.insert(verified) {
                    Ok(()) => {
                        state.transfer.confirm(seq, len);
                        state.transfer.advance(TransferStatus::Transferring);
                        ChunkOutcome::Accepted {
                            progress: state.progress_event(),
                            complete: state.buffer.is_complete(),
                            ack,
                        }
                    }
                    Err(e @ ShareError::SizeViolation(..)) => ChunkOutcome::Violation(e, true),
                    Err(e @ (ShareError::SequenceOutOfRange(..) | ShareError::TooManyEarlyChunks(..))) => {
                        state.violations += 1;
                        ChunkOutcome::Violation(e, state.violations > self.max_violations)
                    }
                    Err(_) => ChunkOutcome::Duplicate { ack },
                }
            }
        };

        match outcome {
            ChunkOutcome::Accepted { progress, complete, ack } => {
                if ack {
                    self.reply(peer_id, WireMessage::ChunkAck { transfer_id: transfer_id.to_string(), seq })
                        .await;
                }
                self.events.emit(progress);
                if complete {
                    self.complete(&key).await;
                }
            }
            ChunkOutcome::Duplicate { ack: true } | ChunkOutcome::Finished(Settled::Delivered) => {
                debug!("Re-acknowledging chunk {} of {}", seq, transfer_id);
                self.reply(peer_id, WireMessage::ChunkAck { transfer_id: transfer_id.to_string(), seq })
                    .await;
            }
            ChunkOutcome::Duplicate { ack: false } => {
                debug!("Chunk {} of {} already held, waiting for the offer", seq, transfer_id);
            }
            ChunkOutcome::Finished(Settled::Failed) => self.refuse(peer_id, transfer_id).await,
            ChunkOutcome::Violation(e, fatal) => {
                warn!("Protocol violation from {}: {}", peer_id, e);
                if fatal {
                    self.fail(peer_id, transfer_id, e, true).await;
                }
            }
        }
    }

    /// Reassemble and deliver a transfer whose chunks are all present
    async fn complete(&self, key: &TransferKey) {
        // Only one caller gets the entry
        let mut state = match self.active.remove_if(key, |_, s| s.buffer.is_complete()) {
            Some((_, state)) => state,
            None => return,
        };
        let (peer_id, transfer_id) = key;

        let payload = match state.buffer.reassemble() {
            Ok(payload) => payload,
            Err(e) => {
                self.settle(key, Settled::Failed);
                state.transfer.advance(TransferStatus::Error);
                self.report_failure(peer_id, transfer_id, e, true).await;
                return;
            }
        };
        self.settle(key, Settled::Delivered);

        state.transfer.advance(TransferStatus::Completed);
        let metadata = state.transfer.metadata(peer_id.clone());
        info!(
            "Transfer {} from {} complete: {} ({} bytes)",
            transfer_id, peer_id, metadata.name, payload.len()
        );
        self.events.emit(ShareEvent::TransferComplete {
            transfer_id: transfer_id.clone(),
            payload: payload.clone(),
            metadata: metadata.clone(),
        });

        if let Err(e) = self.persistence.transfer_completed(&metadata, &payload).await {
            let err = ShareError::Persistence(e.to_string());
            warn!("Transfer {} delivered but not persisted: {}", transfer_id, err);
        }
    }

    /// Fail an active transfer
    async fn fail(&self, peer_id: &PeerId, transfer_id: &str, reason: ShareError, notify_peer: bool) {
        let key = (peer_id.clone(), transfer_id.to_string());
        self.active.remove(&key);
        self.settle(&key, Settled::Failed);
        self.report_failure(peer_id, transfer_id, reason, notify_peer).await;
    }

    async fn report_failure(&self, peer_id: &PeerId, transfer_id: &str, reason: ShareError, notify_peer: bool) {
        warn!("Inbound transfer {} from {} failed: {}", transfer_id, peer_id, reason);
        if notify_peer {
            self.reply(
                peer_id,
                WireMessage::TransferCancel {
                    transfer_id: transfer_id.to_string(),
                    reason: reason.to_string(),
                },
            )
            .await;
        }
        self.events.emit(ShareEvent::TransferError {
            transfer_id: transfer_id.to_string(),
            direction: Direction::Receive,
            reason,
        });
    }

    /// Sender abandoned the transfer, returns false if it was not active
    pub async fn on_remote_cancel(&self, peer_id: &PeerId, transfer_id: &str, reason: &str) -> bool {
        let key = (peer_id.clone(), transfer_id.to_string());
        if self.active.remove(&key).is_none() {
            return false;
        }
        self.settle(&key, Settled::Failed);
        self.report_failure(
            peer_id,
            transfer_id,
            ShareError::TransferCancelled(format!("cancelled by sender: {}", reason)),
            false,
        )
        .await;
        true
    }

    /// Fail every transfer from a peer whose session closed
    pub async fn cancel_peer(&self, peer_id: &PeerId, reason: &str) -> usize {
        let keys: Vec<TransferKey> = self
            .active
            .iter()
            .filter(|e| e.key().0 == *peer_id)
            .map(|e| e.key().clone())
            .collect();

        let mut cancelled = 0;
        for (peer, transfer_id) in keys {
            if self.active.remove(&(peer.clone(), transfer_id.clone())).is_some() {
                cancelled += 1;
                self.report_failure(
                    &peer,
                    &transfer_id,
                    ShareError::TransferCancelled(reason.to_string()),
                    false,
                )
                .await;
            }
        }
        self.finished.retain(|key, _| key.0 != *peer_id);
        cancelled
    }

    /// Fail transfers idle longer than `idle`, returns the number expired
    pub async fn expire_stalled(&self, idle: Duration) -> usize {
        let stalled: Vec<TransferKey> = self
            .active
            .iter()
            .filter(|e| e.last_activity.elapsed() > idle)
            .map(|e| e.key().clone())
            .collect();

        let mut expired = 0;
        for (peer_id, transfer_id) in stalled {
            if self.active.contains_key(&(peer_id.clone(), transfer_id.clone())) {
                expired += 1;
                let reason = ShareError::TransferCancelled(format!("no progress for {}s", idle.as_secs()));
                self.fail(&peer_id, &transfer_id, reason, true).await;
            }
        }

        self.finished.retain(|_, entry| entry.0.elapsed() <= idle);
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::split_into_chunks;
    use crate::error::Result;
    use crate::events::NoopPersistence;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<WireMessage>>);

    impl Recorder {
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

    fn setup() -> (InboundTransfers, Arc<Recorder>, broadcast::Receiver<ShareEvent>) {
        let recorder = Arc::new(Recorder::default());
        let bus = Arc::new(EventBus::new(1024));
        let rx = bus.subscribe();
        let table = InboundTransfers::new(recorder.clone(), bus, Arc::new(NoopPersistence), 8, 16);
        (table, recorder, rx)
    }

    fn peer() -> PeerId {
        PeerId::parse("AAAA0001").unwrap()
    }

    fn completed(rx: &mut broadcast::Receiver<ShareEvent>) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ShareEvent::TransferComplete { payload, metadata, .. } = event {
                assert_eq!(metadata.sender_id, peer());
                out.push(payload);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_chunks_before_offer_are_buffered() {
        let (table, recorder, mut rx) = setup();
        let data = Bytes::from(vec![3u8; 3000]);
        let chunks = split_into_chunks(&data, 1024);

        for chunk in chunks.iter().rev() {
            table
                .on_chunk(&peer(), "t1", chunk.seq, chunk.payload.clone(), chunk.checksum.clone())
                .await;
        }
        // Held, but not acknowledged until the offer arrives
        assert_eq!(recorder.count("chunk-ack"), 0);
        assert!(completed(&mut rx).is_empty());

        table
            .on_offer(&peer(), "t1", "f.bin".into(), 3000, "application/octet-stream".into(), 3, 1024)
            .await;
        assert_eq!(recorder.count("chunk-ack"), 3);
        assert_eq!(completed(&mut rx), vec![data]);
        assert_eq!(table.active_count(), 0);
        assert_eq!(recorder.count("file-offer-ack"), 1);
    }

    #[tokio::test]
    async fn test_corrupt_chunk_requests_one_retransmit() {
        let (table, recorder, _rx) = setup();
        table
            .on_offer(&peer(), "t1", "f".into(), 4, "text/plain".into(), 1, 1024)
            .await;
        let good = Chunk::new(0, Bytes::from_static(b"abcd"));
        table
            .on_chunk(&peer(), "t1", 0, Bytes::from_static(b"abce"), good.checksum.clone())
            .await;

        assert_eq!(recorder.count("chunk-retransmit"), 1);
        assert_eq!(recorder.count("chunk-ack"), 0);
        assert_eq!(table.received_chunks(&peer(), "t1"), Some(0));

        table.on_chunk(&peer(), "t1", 0, good.payload, good.checksum).await;
        assert_eq!(recorder.count("chunk-ack"), 1);
        assert_eq!(table.active_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_is_reacked_not_stored() {
        let (table, recorder, _rx) = setup();
        table
            .on_offer(&peer(), "t1", "f".into(), 2048, "x".into(), 2, 1024)
            .await;
        let chunk = Chunk::new(0, Bytes::from(vec![1u8; 1024]));
        table.on_chunk(&peer(), "t1", 0, chunk.payload.clone(), chunk.checksum.clone()).await;
        table.on_chunk(&peer(), "t1", 0, chunk.payload, chunk.checksum).await;
        assert_eq!(recorder.count("chunk-ack"), 2);
        assert_eq!(table.received_chunks(&peer(), "t1"), Some(1));
    }

    #[tokio::test]
    async fn test_out_of_range_fails_after_limit() {
        let (table, recorder, mut rx) = setup();
        table
            .on_offer(&peer(), "t1", "f".into(), 1024, "x".into(), 1, 1024)
            .await;
        let stray = Chunk::new(5, Bytes::from_static(b"zz"));
        for _ in 0..9 {
            table.on_chunk(&peer(), "t1", 5, stray.payload.clone(), stray.checksum.clone()).await;
        }
        assert_eq!(table.active_count(), 0);
        assert_eq!(recorder.count("transfer-cancel"), 1);

        let mut errors = 0;
        while let Ok(event) = rx.try_recv() {
            if let ShareEvent::TransferError { reason, .. } = event {
                assert!(matches!(reason, ShareError::SequenceOutOfRange(_, 5, 1)));
                errors += 1;
            }
        }
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn test_bad_offer_is_size_violation() {
        let (table, recorder, _rx) = setup();
        table
            .on_offer(&peer(), "t1", "f".into(), 5000, "x".into(), 2, 1024)
            .await;
        assert_eq!(recorder.count("transfer-cancel"), 1);
        assert_eq!(table.active_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_transfer_is_never_acknowledged() {
        let (table, recorder, _rx) = setup();
        table
            .on_offer(&peer(), "t1", "f".into(), 5000, "x".into(), 2, 1024)
            .await;
        assert_eq!(recorder.count("transfer-cancel"), 1);

        // Late chunk and a re-sent offer for the failed transfer
        let chunk = Chunk::new(0, Bytes::from(vec![1u8; 1024]));
        table.on_chunk(&peer(), "t1", 0, chunk.payload, chunk.checksum).await;
        table
            .on_offer(&peer(), "t1", "f".into(), 5000, "x".into(), 2, 1024)
            .await;

        assert_eq!(recorder.count("chunk-ack"), 0);
        assert_eq!(recorder.count("file-offer-ack"), 0);
        assert_eq!(recorder.count("transfer-cancel"), 3);
        assert_eq!(table.active_count(), 0);
    }

    #[tokio::test]
    async fn test_delivered_transfer_is_reacknowledged() {
        let (table, recorder, _rx) = setup();
        table
            .on_offer(&peer(), "t1", "f".into(), 4, "x".into(), 1, 1024)
            .await;
        let chunk = Chunk::new(0, Bytes::from_static(b"done"));
        table.on_chunk(&peer(), "t1", 0, chunk.payload.clone(), chunk.checksum.clone()).await;
        assert_eq!(table.active_count(), 0);

        table.on_chunk(&peer(), "t1", 0, chunk.payload, chunk.checksum).await;
        table
            .on_offer(&peer(), "t1", "f".into(), 4, "x".into(), 1, 1024)
            .await;
        assert_eq!(recorder.count("chunk-ack"), 2);
        assert_eq!(recorder.count("file-offer-ack"), 2);
        assert_eq!(recorder.count("transfer-cancel"), 0);
    }

    #[tokio::test]
    async fn test_chunks_ahead_of_offer_are_bounded() {
        let (table, recorder, mut rx) = setup();
        let payload = Bytes::from(vec![9u8; 4096]);
        let checksum = Chunk::new(0, payload.clone()).checksum;
        for seq in 0..5000u32 {
            table
                .on_chunk(&peer(), "t1", seq * 7919, payload.clone(), checksum.clone())
                .await;
            if table.active_count() == 0 {
                break;
            }
            assert!(table.received_chunks(&peer(), "t1").unwrap() <= 16);
        }

        // 16 held, then every further chunk is a violation until the limit fails the transfer
        assert_eq!(table.active_count(), 0);
        assert_eq!(recorder.count("chunk-ack"), 0);
        assert_eq!(recorder.count("transfer-cancel"), 1);
        let mut reasons = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ShareEvent::TransferError { reason, .. } = event {
                reasons.push(reason);
            }
        }
        assert_eq!(reasons, vec![ShareError::TooManyEarlyChunks("t1".into(), 16)]);
    }

    #[tokio::test]
    async fn test_chunk_past_declared_size_fails_transfer() {
        let (table, recorder, mut rx) = setup();
        table
            .on_offer(&peer(), "t1", "f".into(), 1500, "x".into(), 2, 1024)
            .await;
        let first = Chunk::new(0, Bytes::from(vec![1u8; 1024]));
        table.on_chunk(&peer(), "t1", 0, first.payload, first.checksum).await;
        // Within the chunk size, but 1024 + 1024 > 1500
        let second = Chunk::new(1, Bytes::from(vec![2u8; 1024]));
        table.on_chunk(&peer(), "t1", 1, second.payload, second.checksum).await;

        assert_eq!(recorder.count("chunk-ack"), 1);
        assert_eq!(recorder.count("transfer-cancel"), 1);
        assert_eq!(table.active_count(), 0);
        let mut reasons = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ShareEvent::TransferError { reason, .. } = event {
                reasons.push(reason);
            }
        }
        assert_eq!(reasons, vec![ShareError::SizeViolation("t1".into(), 2048, 1500)]);
    }

    #[tokio::test]
    async fn test_oversized_chunk_fails_transfer() {
        let (table, recorder, _rx) = setup();
        table
            .on_offer(&peer(), "t1", "f".into(), 4096, "x".into(), 4, 1024)
            .await;
        let long = Chunk::new(0, Bytes::from(vec![1u8; 2048]));
        table.on_chunk(&peer(), "t1", 0, long.payload, long.checksum).await;

        assert_eq!(recorder.count("chunk-ack"), 0);
        assert_eq!(recorder.count("transfer-cancel"), 1);
        assert_eq!(table.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_peer_fails_its_transfers() {
        let (table, _recorder, _rx) = setup();
        table
            .on_offer(&peer(), "t1", "f".into(), 2048, "x".into(), 2, 1024)
            .await;
        table
            .on_offer(&peer(), "t2", "g".into(), 2048, "x".into(), 2, 1024)
            .await;
        assert_eq!(table.cancel_peer(&peer(), "session closed").await, 2);
        assert_eq!(table.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_stalled() {
        let (table, _recorder, _rx) = setup();
        table
            .on_offer(&peer(), "t1", "f".into(), 2048, "x".into(), 2, 1024)
            .await;
        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(table.expire_stalled(Duration::from_secs(120)).await, 1);
        assert_eq!(table.active_count(), 0);
    }
}
