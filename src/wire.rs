//! Wire messages exchanged over a peer channel
//!
//! Frames are JSON text, internally tagged by `"type"` with kebab-case kind
//! names and camelCase fields. Binary payloads travel as base64 strings.

use crate::error::{Result, ShareError};
use crate::types::LeaveReason;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Messages understood by both ends of a channel
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    /// Handshake announcement
    #[serde(rename_all = "camelCase")]
    UserInfo {
        display_name: Option<String>,
        /// Random per-process id, changes when the peer restarts
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance: Option<String>,
    },

    /// Chat text
    ChatMessage {
        id: String,
        message: String,
        /// Sender's wall clock, Unix millis
        timestamp: u64,
    },

    /// Transfer header, sent before the chunks
    #[serde(rename_all = "camelCase")]
    FileOffer {
        transfer_id: String,
        name: String,
        size: u64,
        mime_type: String,
        total_chunks: u32,
        chunk_size: u32,
    },

    /// Receiver has the header
    #[serde(rename_all = "camelCase")]
    FileOfferAck { transfer_id: String },

    /// One chunk of file data
    #[serde(rename_all = "camelCase")]
    FileChunk {
        transfer_id: String,
        seq: u32,
        #[serde(with = "base64_payload")]
        payload: Bytes,
        checksum: String,
    },

    /// Chunk verified and stored
    #[serde(rename_all = "camelCase")]
    ChunkAck { transfer_id: String, seq: u32 },

    /// Chunk failed verification, send it again
    #[serde(rename_all = "camelCase")]
    ChunkRetransmit { transfer_id: String, seq: u32 },

    /// Either side abandons a transfer
    #[serde(rename_all = "camelCase")]
    TransferCancel { transfer_id: String, reason: String },

    /// Liveness probe
    HealthCheck { timestamp: u64 },

    /// Liveness reply, echoes the probe timestamp
    HealthCheckResponse { timestamp: u64 },

    /// Voluntary disconnect notice
    PeerLeaving { reason: LeaveReason, timestamp: u64 },
}

impl WireMessage {
    /// Get message kind as on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::UserInfo { .. } => "user-info",
            WireMessage::ChatMessage { .. } => "chat-message",
            WireMessage::FileOffer { .. } => "file-offer",
            WireMessage::FileOfferAck { .. } => "file-offer-ack",
            WireMessage::FileChunk { .. } => "file-chunk",
            WireMessage::ChunkAck { .. } => "chunk-ack",
            WireMessage::ChunkRetransmit { .. } => "chunk-retransmit",
            WireMessage::TransferCancel { .. } => "transfer-cancel",
            WireMessage::HealthCheck { .. } => "health-check",
            WireMessage::HealthCheckResponse { .. } => "health-check-response",
            WireMessage::PeerLeaving { .. } => "peer-leaving",
        }
    }

    /// Transfer this message belongs to, if any
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            WireMessage::FileOffer { transfer_id, .. }
            | WireMessage::FileOfferAck { transfer_id }
            | WireMessage::FileChunk { transfer_id, .. }
            | WireMessage::ChunkAck { transfer_id, .. }
            | WireMessage::ChunkRetransmit { transfer_id, .. }
            | WireMessage::TransferCancel { transfer_id, .. } => Some(transfer_id),
            _ => None,
        }
    }

    /// Serialize to a frame
    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ShareError::Encode(e.to_string()))
    }

    /// Deserialize a frame
    pub fn decode(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame).map_err(|e| ShareError::Decode(e.to_string()))
    }
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
