//! Core types shared by sessions, transfers and analytics

use crate::error::{Result, ShareError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

/// Length of every peer id
pub const PEER_ID_LEN: usize = 8;

/// Fixed-length alphanumeric peer identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Parse and validate a peer id
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.len() != PEER_ID_LEN || !raw.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ShareError::InvalidPeerId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Generate a random id
    pub fn generate() -> Self {
        const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
        let mut rng = rand::thread_rng();
        let id = (0..PEER_ID_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    /// Borrow as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PeerId {
    type Error = ShareError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-peer lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerLifecycle {
    Disconnected,
    Connecting,
    Open,
    /// Silent past the soft threshold, health check outstanding
    Stale,
    Closed,
}

/// Process-wide connectivity state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Initializing,
    Ready,
    /// At least one open session
    Connected(usize),
}

/// Which side opened a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Initiator {
    Local,
    Remote,
}

/// Why a peer is leaving voluntarily
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaveReason {
    /// User asked to disconnect
    Manual,
    /// Application code disconnected
    Programmatic,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaveReason::Manual => write!(f, "manual"),
            LeaveReason::Programmatic => write!(f, "programmatic"),
            LeaveReason::Unknown => write!(f, "unknown"),
        }
    }
}

/// Reason attached to the terminal `Closed` state of a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// We disconnected and told the peer
    LocalDisconnect(LeaveReason),
    /// The peer announced it was leaving
    RemoteLeft(LeaveReason),
    /// The channel closed without notice
    ChannelClosed(String),
    /// The channel reported an error
    ChannelError(String),
    /// Silence past the hard threshold
    LivenessTimeout,
    /// Node shutdown
    Shutdown,
}

impl CloseReason {
    /// Intentional disconnects should make the peer forgettable, silent loss
    /// may later be offered for reconnection
    pub fn is_intentional(&self) -> bool {
        matches!(
            self,
            CloseReason::LocalDisconnect(_) | CloseReason::RemoteLeft(_) | CloseReason::Shutdown
        )
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::LocalDisconnect(r) => write!(f, "local disconnect ({})", r),
            CloseReason::RemoteLeft(r) => write!(f, "remote left ({})", r),
            CloseReason::ChannelClosed(r) => write!(f, "channel closed: {}", r),
            CloseReason::ChannelError(e) => write!(f, "channel error: {}", e),
            CloseReason::LivenessTimeout => write!(f, "liveness timeout"),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Transfer direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Send,
    Receive,
}

/// Transfer status, monotonic
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Error,
}

impl TransferStatus {
    fn rank(self) -> u8 {
        match self {
            TransferStatus::Pending => 0,
            TransferStatus::Transferring => 1,
            TransferStatus::Completed | TransferStatus::Error => 2,
        }
    }

    /// Terminal states never change, the rest only move forward
    pub fn can_advance_to(self, next: TransferStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Error)
    }
}

/// Metadata delivered with a completed transfer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub sender_id: PeerId,
}

/// Bookkeeping record of one file transfer
#[derive(Clone, Debug)]
pub struct FileTransfer {
    /// Transfer id, shared by both sides
    pub id: String,
    /// Remote peer
    pub peer_id: PeerId,
    pub name: String,
    /// Declared size in bytes
    pub size: u64,
    pub mime_type: String,
    pub direction: Direction,
    /// Number of chunks, unknown on the receive side until the offer arrives
    pub total_chunks: Option<u32>,
    /// Received (receive side) or acknowledged (send side) sequence numbers
    pub confirmed: BTreeSet<u32>,
    pub status: TransferStatus,
    pub bytes_confirmed: u64,
    pub retransmits: u32,
    pub started_at: SystemTime,
}

impl FileTransfer {
    /// Create a new transfer record
    pub fn new(id: String, peer_id: PeerId, direction: Direction) -> Self {
        Self {
            id,
            peer_id,
            name: String::new(),
            size: 0,
            mime_type: String::new(),
            direction,
            total_chunks: None,
            confirmed: BTreeSet::new(),
            status: TransferStatus::Pending,
            bytes_confirmed: 0,
            retransmits: 0,
            started_at: SystemTime::now(),
        }
    }

    /// Record a confirmed chunk, returns false if it was already confirmed
    pub fn confirm(&mut self, seq: u32, bytes: u64) -> bool {
        if !self.confirmed.insert(seq) {
            return false;
        }
        self.bytes_confirmed += bytes;
        true
    }

    /// Move to a new status, refusing regressions
    pub fn advance(&mut self, next: TransferStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Fraction of the declared size confirmed so far
    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            return if self.status == TransferStatus::Completed { 1.0 } else { 0.0 };
        }
        (self.bytes_confirmed as f64 / self.size as f64).min(1.0)
    }

    /// True once every sequence number in `[0, total_chunks)` is confirmed
    pub fn is_fully_confirmed(&self) -> bool {
        match self.total_chunks {
            Some(total) => {
                self.confirmed.len() == total as usize
                    && self.confirmed.iter().next_back().map_or(total == 0, |last| *last + 1 == total)
            }
            None => false,
        }
    }

    /// Metadata for completion events
    pub fn metadata(&self, sender_id: PeerId) -> TransferMetadata {
        TransferMetadata {
            name: self.name.clone(),
            mime_type: self.mime_type.clone(),
            size: self.size,
            sender_id,
        }
    }
}

/// Exponential backoff with jitter for signaling reconnection
#[derive(Clone, Debug)]
pub struct BackoffState {
    /// Base delay of the first attempt
    pub base_delay: Duration,
    /// Cap applied to every delay, jitter included
    pub max_delay: Duration,
    /// Attempts made so far
    pub failed_attempts: u32,
    /// Attempts allowed before giving up
    pub max_attempts: u32,
}

/// Lower bound of the jitter fraction
pub const JITTER_MIN: f64 = 0.2;
/// Upper bound of the jitter fraction
pub const JITTER_MAX: f64 = 0.5;

impl BackoffState {
    /// Create new backoff state
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            failed_attempts: 0,
            max_attempts,
        }
    }

    /// Base delay for the next attempt, before jitter
    pub fn current_base(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.failed_attempts.min(20));
        self.base_delay.saturating_mul(factor)
    }

    /// Next delay with a random jitter, `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        self.next_delay_with_jitter(jitter)
    }

    /// Next delay with an explicit jitter fraction (clamped to 20-50%)
    pub fn next_delay_with_jitter(&mut self, jitter: f64) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let jitter = jitter.clamp(JITTER_MIN, JITTER_MAX);
        let base = self.current_base();
        let delay = base.saturating_add(base.mul_f64(jitter)).min(self.max_delay);
        self.failed_attempts += 1;
        Some(delay)
    }

    /// True when no attempts remain
    pub fn is_exhausted(&self) -> bool {
        self.failed_attempts >= self.max_attempts
    }

    /// Reset backoff state
    pub fn reset(&mut self) {
        self.failed_attempts = 0;
    }
}

/// Read-only view of a session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub display_name: Option<String>,
    pub state: PeerLifecycle,
    /// Unix seconds
    pub connected_at: u64,
    /// Seconds since the last inbound frame
    pub idle_secs: u64,
    pub latency_ms: Option<u64>,
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
