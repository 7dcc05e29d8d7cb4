//! Per-peer session state owned by the connection manager

use crate::transport::TransportChannel;
use crate::types::{Initiator, PeerId, PeerInfo, PeerLifecycle};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// One live session with a peer
#[derive(Clone)]
pub struct PeerSession {
    /// Remote peer
    pub peer_id: PeerId,
    /// Name announced in `user-info`
    pub display_name: Option<String>,
    /// Process instance announced in `user-info`
    pub instance: Option<String>,
    /// Wall-clock open time
    pub connected_at: SystemTime,
    /// Last inbound frame
    pub last_seen: Instant,
    /// Channel carrying the session
    pub channel: Arc<dyn TransportChannel>,
    /// Identifies the channel, events from older channels are ignored
    pub channel_id: u64,
    pub state: PeerLifecycle,
    /// Which side opened the channel
    pub initiator: Initiator,
    /// Last health-check round trip
    pub latency_ms: Option<u64>,
}

impl PeerSession {
    /// Create new open session
    pub fn new(
        peer_id: PeerId,
        channel: Arc<dyn TransportChannel>,
        channel_id: u64,
        initiator: Initiator,
    ) -> Self {
        Self {
            peer_id,
            display_name: None,
            instance: None,
            connected_at: SystemTime::now(),
            last_seen: Instant::now(),
            channel,
            channel_id,
            state: PeerLifecycle::Open,
            initiator,
            latency_ms: None,
        }
    }

    /// Record inbound traffic, returns true if this revived a stale session
    pub fn touch(&mut self) -> bool {
        self.last_seen = Instant::now();
        if self.state == PeerLifecycle::Stale {
            self.state = PeerLifecycle::Open;
            return true;
        }
        false
    }

    /// Time since the last inbound frame
    pub fn silence(&self) -> Duration {
        self.last_seen.elapsed()
    }

    pub fn mark_stale(&mut self) {
        if self.state == PeerLifecycle::Open {
            self.state = PeerLifecycle::Stale;
        }
    }

    /// Move to a replacement channel, returns the old one
    pub fn swap_channel(
        &mut self,
        channel: Arc<dyn TransportChannel>,
        channel_id: u64,
        initiator: Initiator,
    ) -> (Arc<dyn TransportChannel>, Initiator) {
        let old_channel = std::mem::replace(&mut self.channel, channel);
        let old_initiator = std::mem::replace(&mut self.initiator, initiator);
        self.channel_id = channel_id;
        self.state = PeerLifecycle::Open;
        self.last_seen = Instant::now();
        (old_channel, old_initiator)
    }

    /// Read-only view
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
            state: self.state,
            connected_at: self
                .connected_at
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            idle_secs: self.silence().as_secs(),
            latency_ms: self.latency_ms,
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id)
            .field("channel_id", &self.channel_id)
            .field("state", &self.state)
            .field("initiator", &self.initiator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;

    fn session() -> PeerSession {
        let net = MemoryNetwork::new();
        let a = PeerId::parse("AAAA0001").unwrap();
        let b = PeerId::parse("BBBB0001").unwrap();
        let (end, _other) = net.channel_pair(&a, &b);
        PeerSession::new(b, end.channel, 1, Initiator::Local)
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_revives_stale() {
        let mut s = session();
        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(s.silence() >= Duration::from_secs(21));
        s.mark_stale();
        assert_eq!(s.state, PeerLifecycle::Stale);
        assert!(s.touch());
        assert_eq!(s.state, PeerLifecycle::Open);
        assert!(s.silence() < Duration::from_secs(1));
        assert!(!s.touch());
    }

    #[tokio::test]
    async fn test_swap_channel() {
        let mut s = session();
        let net = MemoryNetwork::new();
        let (end, _other) = net.channel_pair(&PeerId::parse("AAAA0001").unwrap(), &s.peer_id);
        let (_old, old_initiator) = s.swap_channel(end.channel, 2, Initiator::Remote);
        assert_eq!(old_initiator, Initiator::Local);
        assert_eq!(s.channel_id, 2);
        assert_eq!(s.initiator, Initiator::Remote);
        assert_eq!(s.info().state, PeerLifecycle::Open);
    }
}
