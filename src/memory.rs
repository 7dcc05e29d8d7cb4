//! In-process transport for tests and local demos
//!
//! A [`MemoryNetwork`] connects any number of registered nodes with channel
//! pairs. Frame filters can drop or rewrite frames per direction to simulate a
//! lossy or corrupting link.

use crate::error::{Result, ShareError};
use crate::transport::{ChannelEvent, IncomingChannel, OpenChannel, SignalingProvider, TransportChannel};
use crate::types::PeerId;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// What to do with a frame in flight
#[derive(Clone, Debug)]
pub enum FrameAction {
    Deliver,
    Drop,
    /// Deliver different bytes instead
    Replace(Bytes),
}

/// Per-direction frame filter
pub type FrameFilter = Arc<dyn Fn(&Bytes) -> FrameAction + Send + Sync>;

/// Frame counters across the whole network
#[derive(Debug, Default)]
pub struct LinkStats {
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub replaced: AtomicU64,
}

/// Registry of in-process nodes
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: DashMap<PeerId, mpsc::UnboundedSender<IncomingChannel>>,
    filters: DashMap<(PeerId, PeerId), FrameFilter>,
    open_delays: DashMap<PeerId, Arc<Mutex<VecDeque<Duration>>>>,
    pub stats: LinkStats,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node, returns its signaling handle and its inbound channel stream
    pub fn register(self: &Arc<Self>, peer_id: PeerId) -> (Arc<MemorySignaling>, mpsc::UnboundedReceiver<IncomingChannel>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.insert(peer_id.clone(), tx);
        debug!("Registered memory node: {}", peer_id);
        let signaling = Arc::new(MemorySignaling {
            network: self.clone(),
            local: peer_id,
            link_up: AtomicBool::new(true),
            low_bandwidth: AtomicBool::new(false),
            opens: AtomicU64::new(0),
        });
        (signaling, rx)
    }

    /// Remove a node, later dials to it fail
    pub fn deregister(&self, peer_id: &PeerId) {
        self.nodes.remove(peer_id);
    }

    /// Install a filter for frames sent from `from` to `to`
    pub fn set_filter(&self, from: &PeerId, to: &PeerId, filter: FrameFilter) {
        self.filters.insert((from.clone(), to.clone()), filter);
    }

    /// Remove a filter
    pub fn clear_filter(&self, from: &PeerId, to: &PeerId) {
        self.filters.remove(&(from.clone(), to.clone()));
    }

    /// Script how long each successive dial from `dialer` takes to open
    pub fn script_open_delays(&self, dialer: &PeerId, delays: Vec<Duration>) {
        self.open_delays
            .insert(dialer.clone(), Arc::new(Mutex::new(delays.into_iter().collect())));
    }

    fn next_open_delay(&self, dialer: &PeerId) -> Option<Duration> {
        let script = self.open_delays.get(dialer).map(|s| s.value().clone())?;
        let mut queue = script.lock().ok()?;
        queue.pop_front()
    }

    fn filter_frame(&self, from: &PeerId, to: &PeerId, frame: Bytes) -> Option<Bytes> {
        let filter = self
            .filters
            .get(&(from.clone(), to.clone()))
            .map(|f| f.value().clone());
        let action = match filter {
            Some(filter) => filter(&frame),
            None => FrameAction::Deliver,
        };
        match action {
            FrameAction::Deliver => {
                self.stats.delivered.fetch_add(1, Ordering::SeqCst);
                Some(frame)
            }
            FrameAction::Drop => {
                self.stats.dropped.fetch_add(1, Ordering::SeqCst);
                None
            }
            FrameAction::Replace(replacement) => {
                self.stats.replaced.fetch_add(1, Ordering::SeqCst);
                Some(replacement)
            }
        }
    }

    /// Build a connected channel pair, first element belongs to `a`
    pub fn channel_pair(self: &Arc<Self>, a: &PeerId, b: &PeerId) -> (OpenChannel, OpenChannel) {
        let open = Arc::new(AtomicBool::new(true));
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let end_a = MemoryChannel {
            network: self.clone(),
            from: a.clone(),
            to: b.clone(),
            open: open.clone(),
            remote_tx: tx_b.clone(),
            local_tx: tx_a.clone(),
        };
        let end_b = MemoryChannel {
            network: self.clone(),
            from: b.clone(),
            to: a.clone(),
            open,
            remote_tx: tx_a,
            local_tx: tx_b,
        };

        (
            OpenChannel { channel: Arc::new(end_a), events: rx_a },
            OpenChannel { channel: Arc::new(end_b), events: rx_b },
        )
    }
}

/// One end of an in-process channel
pub struct MemoryChannel {
    network: Arc<MemoryNetwork>,
    from: PeerId,
    to: PeerId,
    open: Arc<AtomicBool>,
    remote_tx: mpsc::UnboundedSender<ChannelEvent>,
    local_tx: mpsc::UnboundedSender<ChannelEvent>,
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    async fn send(&self, frame: Bytes) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ShareError::ChannelClosed(self.to.to_string()));
        }
        if let Some(frame) = self.network.filter_frame(&self.from, &self.to, frame) {
            self.remote_tx
                .send(ChannelEvent::Message(frame))
                .map_err(|_| ShareError::ChannelClosed(self.to.to_string()))?;
        }
        Ok(())
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.remote_tx.send(ChannelEvent::Closed("closed by remote".to_string()));
            let _ = self.local_tx.send(ChannelEvent::Closed("closed locally".to_string()));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Signaling handle of one registered node
pub struct MemorySignaling {
    network: Arc<MemoryNetwork>,
    local: PeerId,
    link_up: AtomicBool,
    low_bandwidth: AtomicBool,
    opens: AtomicU64,
}

impl MemorySignaling {
    /// Simulate the signaling link going down or coming back
    pub fn set_link_up(&self, up: bool) {
        self.link_up.store(up, Ordering::SeqCst);
    }

    pub fn set_low_bandwidth(&self, slow: bool) {
        self.low_bandwidth.store(slow, Ordering::SeqCst);
    }

    /// Dial attempts that produced a channel
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingProvider for MemorySignaling {
    async fn open(&self, peer_id: &PeerId) -> Result<OpenChannel> {
        if !self.link_up.load(Ordering::SeqCst) {
            return Err(ShareError::Transport("signaling link down".to_string()));
        }
        if let Some(delay) = self.network.next_open_delay(&self.local) {
            tokio::time::sleep(delay).await;
        }

        let target = self
            .network
            .nodes
            .get(peer_id)
            .map(|n| n.value().clone())
            .ok_or_else(|| ShareError::PeerUnreachable(peer_id.to_string()))?;

        let (local_end, remote_end) = self.network.channel_pair(&self.local, peer_id);
        target
            .send(IncomingChannel {
                peer_id: self.local.clone(),
                channel: remote_end,
            })
            .map_err(|_| ShareError::PeerUnreachable(peer_id.to_string()))?;

        self.opens.fetch_add(1, Ordering::SeqCst);
        debug!("Memory channel opened: {} -> {}", self.local, peer_id);
        Ok(local_end)
    }

    async fn reconnect(&self) -> Result<()> {
        if self.link_up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ShareError::Transport("signaling link down".to_string()))
        }
    }

    fn low_bandwidth(&self) -> bool {
        self.low_bandwidth.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let net = MemoryNetwork::new();
        let (mut a, mut b) = net.channel_pair(&id("AAAA0001"), &id("BBBB0001"));
        a.channel.send(Bytes::from_static(b"one")).await.unwrap();
        a.channel.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(b.events.recv().await, Some(ChannelEvent::Message(Bytes::from_static(b"one"))));
        assert_eq!(b.events.recv().await, Some(ChannelEvent::Message(Bytes::from_static(b"two"))));

        b.channel.close().await;
        assert!(matches!(a.events.recv().await, Some(ChannelEvent::Closed(_))));
        assert!(a.channel.send(Bytes::from_static(b"late")).await.is_err());
    }

    #[tokio::test]
    async fn test_filter_drops_frames() {
        let net = MemoryNetwork::new();
        let a_id = id("AAAA0001");
        let b_id = id("BBBB0001");
        net.set_filter(&a_id, &b_id, Arc::new(|_| FrameAction::Drop));
        let (a, mut b) = net.channel_pair(&a_id, &b_id);
        a.channel.send(Bytes::from_static(b"lost")).await.unwrap();
        net.clear_filter(&a_id, &b_id);
        a.channel.send(Bytes::from_static(b"kept")).await.unwrap();
        assert_eq!(b.events.recv().await, Some(ChannelEvent::Message(Bytes::from_static(b"kept"))));
        assert_eq!(net.stats.dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dial_hands_remote_end_to_target() {
        let net = MemoryNetwork::new();
        let (sig_a, _rx_a) = net.register(id("AAAA0001"));
        let (_sig_b, mut rx_b) = net.register(id("BBBB0001"));

        let opened = sig_a.open(&id("BBBB0001")).await.unwrap();
        let incoming = rx_b.recv().await.unwrap();
        assert_eq!(incoming.peer_id, id("AAAA0001"));
        assert!(opened.channel.is_open());
        assert!(sig_a.open(&id("CCCC0001")).await.is_err());
    }

    #[tokio::test]
    async fn test_link_down_fails_open_and_reconnect() {
        let net = MemoryNetwork::new();
        let (sig_a, _rx_a) = net.register(id("AAAA0001"));
        let (_sig_b, _rx_b) = net.register(id("BBBB0001"));
        sig_a.set_link_up(false);
        assert!(sig_a.open(&id("BBBB0001")).await.is_err());
        assert!(sig_a.reconnect().await.is_err());
        sig_a.set_link_up(true);
        assert!(sig_a.reconnect().await.is_ok());
    }
}
