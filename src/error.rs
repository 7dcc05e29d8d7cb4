//! Error types for peer sessions and file transfers

use thiserror::Error;

/// Broad class of a [`ShareError`], used to pick a propagation policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Open failure, unreachable peer, lost channel
    Transport,
    /// Checksum, sequence or size problems on the wire
    Protocol,
    /// Heartbeat timeout
    Liveness,
    /// External persistence failure after a successful transfer
    Resource,
    /// Configuration, shutdown and internal failures
    Other,
}

/// Peer sharing error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShareError {
    /// Peer id is not a fixed-length alphanumeric identifier
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    /// Attempt to connect to our own id
    #[error("Cannot connect to self: {0}")]
    SelfConnect(String),

    /// Peer already has an active or pending session
    #[error("Peer already connected: {0}")]
    AlreadyConnected(String),

    /// Transport did not open within the connect timeout
    #[error("Connection timeout for {0} after {1}s")]
    ConnectTimeout(String, u64),

    /// Signaling layer could not resolve the peer
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Channel is closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// No open session for this peer
    #[error("Peer not connected: {0}")]
    PeerNotConnected(String),

    /// Generic transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Chunk payload does not match its checksum
    #[error("Checksum mismatch for {0} chunk {1}")]
    ChecksumMismatch(String, u32),

    /// Sequence number outside `[0, total_chunks)`
    #[error("Sequence {1} out of range for {0} (total: {2})")]
    SequenceOutOfRange(String, u32, u32),

    /// Chunk was already accepted
    #[error("Duplicate chunk {1} for {0}")]
    DuplicateChunk(String, u32),

    /// More chunks arrived ahead of the offer than the receiver holds
    #[error("Too many chunks for {0} before its offer (limit: {1})")]
    TooManyEarlyChunks(String, usize),

    /// Chunk or payload exceeds what the offer declared
    #[error("Size violation for {0}: {1} bytes (declared: {2})")]
    SizeViolation(String, u64, u64),

    /// Wire message could not be encoded
    #[error("Message encode error: {0}")]
    Encode(String),

    /// Wire message could not be decoded
    #[error("Message decode error: {0}")]
    Decode(String),

    /// Chunk retransmitted too many times
    #[error("Retry budget exhausted for {0} chunk {1} after {2} retries")]
    RetryBudgetExhausted(String, u32, u32),

    /// Transfer cancelled locally, remotely or by session teardown
    #[error("Transfer cancelled: {0}")]
    TransferCancelled(String),

    /// Session silent beyond the hard liveness threshold
    #[error("Liveness timeout for peer {0} after {1}s of silence")]
    LivenessTimeout(String, u64),

    /// External persistence failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Node is shutting down
    #[error("Shutdown in progress")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for sharing operations
pub type Result<T> = std::result::Result<T, ShareError>;

impl ShareError {
    /// Classify the error
    pub fn category(&self) -> ErrorCategory {
        match self {
            ShareError::InvalidPeerId(_)
            | ShareError::SelfConnect(_)
            | ShareError::AlreadyConnected(_)
            | ShareError::ConnectTimeout(_, _)
            | ShareError::PeerUnreachable(_)
            | ShareError::ChannelClosed(_)
            | ShareError::PeerNotConnected(_)
            | ShareError::Transport(_) => ErrorCategory::Transport,
            ShareError::ChecksumMismatch(_, _)
            | ShareError::SequenceOutOfRange(_, _, _)
            | ShareError::DuplicateChunk(_, _)
            | ShareError::SizeViolation(_, _, _)
            | ShareError::TooManyEarlyChunks(_, _)
            | ShareError::Encode(_)
            | ShareError::Decode(_)
            | ShareError::RetryBudgetExhausted(_, _, _)
            | ShareError::TransferCancelled(_) => ErrorCategory::Protocol,
            ShareError::LivenessTimeout(_, _) => ErrorCategory::Liveness,
            ShareError::Persistence(_) => ErrorCategory::Resource,
            ShareError::Config(_) | ShareError::Shutdown | ShareError::Internal(_) => {
                ErrorCategory::Other
            }
        }
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ShareError::ConnectTimeout(_, _)
                | ShareError::PeerUnreachable(_)
                | ShareError::Transport(_)
                | ShareError::ChecksumMismatch(_, _)
                | ShareError::DuplicateChunk(_, _)
        )
    }

    /// Check if error is fatal
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShareError::Config(_) | ShareError::Internal(_))
    }
}

impl From<serde_json::Error> for ShareError {
    fn from(e: serde_json::Error) -> Self {
        ShareError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            ShareError::ConnectTimeout("ABCD1234".into(), 25).category(),
            ErrorCategory::Transport
        );
        assert_eq!(
            ShareError::ChecksumMismatch("t1".into(), 3).category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            ShareError::LivenessTimeout("ABCD1234".into(), 30).category(),
            ErrorCategory::Liveness
        );
        assert_eq!(
            ShareError::Persistence("disk full".into()).category(),
            ErrorCategory::Resource
        );
    }

    #[test]
    fn test_recoverable_and_fatal() {
        assert!(ShareError::ChecksumMismatch("t1".into(), 0).is_recoverable());
        assert!(!ShareError::RetryBudgetExhausted("t1".into(), 0, 4).is_recoverable());
        assert!(ShareError::Config("bad".into()).is_fatal());
        assert!(!ShareError::LivenessTimeout("p".into(), 30).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = ShareError::SizeViolation("t9".into(), 10, 12);
        assert_eq!(err.to_string(), "Size violation for t9: 10 bytes (declared: 12)");
    }
}
