//! Transport channel and signaling abstractions
//!
//! The core never talks to a network directly. A [`SignalingProvider`] turns a
//! peer id into an [`OpenChannel`], and remotely initiated channels are handed
//! to the node through `ShareNode::accept_incoming`. Delivery is ordered while
//! the channel is open but frames may be dropped silently.

use crate::error::Result;
use crate::types::PeerId;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events raised by a channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Inbound frame
    Message(Bytes),
    /// Channel closed, with a reason
    Closed(String),
    /// Channel failed
    Error(String),
}

/// Duplex message channel to one peer
#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Send one frame
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Close the channel, idempotent
    async fn close(&self);

    /// Whether frames can still be sent
    fn is_open(&self) -> bool;
}

/// An opened channel and the stream of its events
pub struct OpenChannel {
    pub channel: Arc<dyn TransportChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl std::fmt::Debug for OpenChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenChannel")
            .field("open", &self.channel.is_open())
            .finish()
    }
}

/// A channel initiated by a remote peer
#[derive(Debug)]
pub struct IncomingChannel {
    pub peer_id: PeerId,
    pub channel: OpenChannel,
}

/// Identity/signaling layer: resolves a peer id to an open channel
#[async_trait]
pub trait SignalingProvider: Send + Sync {
    /// Open a channel to `peer_id`
    async fn open(&self, peer_id: &PeerId) -> Result<OpenChannel>;

    /// Re-establish the signaling link after it dropped
    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Hint that the current link is slow, extends the connect timeout
    fn low_bandwidth(&self) -> bool {
        false
    }
}
