//! Sharing node coordinating sessions, transfers, chat and analytics

use crate::analytics::{AnalyticsAggregator, AnalyticsSnapshot};
use crate::config::ShareConfig;
use crate::connection_manager::{ConnectionManager, InboundHandler};
use crate::error::{Result, ShareError};
use crate::events::{ChatEntry, EventBus, EventSink, PersistenceHook, ShareEvent};
use crate::health_monitor::HealthMonitor;
use crate::outbound_transfer::TransferHandle;
use crate::reconnection_manager::ReconnectionManager;
use crate::transfer_engine::TransferEngine;
use crate::transport::{IncomingChannel, OpenChannel, SignalingProvider};
use crate::types::{now_millis, CloseReason, LeaveReason, PeerId, PeerInfo, ProcessState};
use crate::wire::WireMessage;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Received chat messages, oldest first
struct ChatLog {
    entries: RwLock<VecDeque<ChatEntry>>,
    limit: usize,
}

impl ChatLog {
    fn new(limit: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            limit,
        }
    }

    /// Append unless an entry with the same id is already logged
    async fn push(&self, entry: ChatEntry) -> bool {
        let mut entries = self.entries.write().await;
        if entries.iter().any(|e| e.id == entry.id) {
            return false;
        }
        if entries.len() >= self.limit {
            entries.pop_front();
        }
        entries.push_back(entry);
        true
    }

    async fn snapshot(&self) -> Vec<ChatEntry> {
        self.entries.read().await.iter().cloned().collect()
    }
}

/// Routes session traffic to the chat log and the transfer engine
struct Router {
    engine: Arc<TransferEngine>,
    chat: Arc<ChatLog>,
    events: Arc<EventBus>,
}

#[async_trait]
impl InboundHandler for Router {
    async fn handle_message(&self, peer_id: &PeerId, message: WireMessage) {
        match message {
            WireMessage::ChatMessage { id, message, timestamp } => {
                let entry = ChatEntry {
                    peer_id: peer_id.clone(),
                    id,
                    message,
                    timestamp,
                };
                if self.chat.push(entry.clone()).await {
                    debug!("Chat {} from {}", entry.id, peer_id);
                    self.events.emit(ShareEvent::ChatReceived(entry));
                } else {
                    debug!("Duplicate chat {} from {} dropped", entry.id, peer_id);
                }
            }
            other => {
                let kind = other.kind();
                if !self.engine.handle_message(peer_id, other).await {
                    warn!("Unhandled {} message from {}", kind, peer_id);
                }
            }
        }
    }

    async fn session_closed(&self, peer_id: &PeerId, reason: &CloseReason) {
        self.engine.session_closed(peer_id, reason).await;
    }
}

/// A peer-to-peer sharing node
pub struct ShareNode {
    /// Node configuration
    config: ShareConfig,
    /// Event bus shared by all components
    events: Arc<EventBus>,
    /// Peer sessions
    manager: Arc<ConnectionManager>,
    /// Chunked transfers
    engine: Arc<TransferEngine>,
    /// Transfer and connection analytics
    analytics: Arc<AnalyticsAggregator>,
    /// Signaling link recovery
    reconnection: Arc<ReconnectionManager>,
    chat: Arc<ChatLog>,
    /// Stops every background task
    shutdown_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ShareNode {
    /// Create new sharing node
    pub fn new(
        config: ShareConfig,
        provider: Arc<dyn SignalingProvider>,
        persistence: Arc<dyn PersistenceHook>,
    ) -> Result<Self> {
        config.validate()?;

        let events = Arc::new(EventBus::new(config.event_channel_capacity));
        let manager = Arc::new(ConnectionManager::new(
            config.clone(),
            provider.clone(),
            events.clone(),
            persistence.clone(),
        )?);
        let engine = Arc::new(TransferEngine::new(
            config.clone(),
            manager.clone(),
            events.clone(),
            persistence,
        ));
        let analytics = Arc::new(AnalyticsAggregator::new(&config));
        events.add_sink(analytics.clone());
        let reconnection = Arc::new(ReconnectionManager::new(provider, events.clone(), &config));
        let chat = Arc::new(ChatLog::new(config.chat_history_limit));

        manager.register_handler(Arc::new(Router {
            engine: engine.clone(),
            chat: chat.clone(),
            events: events.clone(),
        }));

        Ok(Self {
            config,
            events,
            manager,
            engine,
            analytics,
            reconnection,
            chat,
            shutdown_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Start background tasks and mark the node ready
    pub async fn start(&self) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(ShareError::Shutdown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Node {} already started", self.local_id());
            return Ok(());
        }

        info!("Starting sharing node {}", self.local_id());
        self.manager.mark_ready();

        let health = HealthMonitor::new(self.manager.clone(), &self.config).spawn(self.shutdown_token.child_token());
        let flush = self
            .analytics
            .spawn_flush(self.events.clone(), self.shutdown_token.child_token());
        let maintenance = self.spawn_maintenance();

        self.tasks.lock().await.extend([health, flush, maintenance]);
        Ok(())
    }

    /// Periodically expire stalled inbound transfers
    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let token = self.shutdown_token.child_token();
        let period = Duration::from_secs(self.config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = engine.expire_stalled().await;
                        if expired > 0 {
                            info!("Expired {} stalled inbound transfers", expired);
                        }
                    }
                }
            }
            debug!("Maintenance task stopped");
        })
    }

    pub fn local_id(&self) -> &PeerId {
        self.manager.local_id()
    }

    /// Connect to a peer by id
    pub async fn connect(&self, peer_id: &str) -> Result<PeerId> {
        if self.shutdown_token.is_cancelled() {
            return Err(ShareError::Shutdown);
        }
        self.manager.connect(peer_id).await
    }

    /// Take over a channel the signaling layer accepted from `peer_id`
    pub async fn accept_incoming(&self, peer_id: PeerId, channel: OpenChannel) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            channel.channel.close().await;
            return Err(ShareError::Shutdown);
        }
        self.manager.accept_incoming(peer_id, channel).await
    }

    /// Accept incoming channels from a signaling stream until shutdown
    pub fn spawn_incoming_listener(&self, incoming: mpsc::UnboundedReceiver<IncomingChannel>) -> JoinHandle<()> {
        self.manager
            .spawn_incoming_listener(incoming, self.shutdown_token.child_token())
    }

    /// Disconnect one peer, returns false if it was not connected
    pub async fn disconnect(&self, peer_id: &PeerId, reason: LeaveReason) -> Result<bool> {
        self.manager.disconnect(peer_id, reason).await
    }

    /// Disconnect every peer
    pub async fn disconnect_all(&self, reason: LeaveReason) -> Result<usize> {
        self.manager.disconnect_all(reason).await
    }

    /// Send a file to a connected peer
    pub fn send_file(
        &self,
        peer_id: &PeerId,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: Bytes,
    ) -> Result<TransferHandle> {
        if self.shutdown_token.is_cancelled() {
            return Err(ShareError::Shutdown);
        }
        self.engine.send_file(peer_id, name, mime_type, data)
    }

    /// Cancel an outbound transfer, returns false if it is not running
    pub fn cancel_transfer(&self, transfer_id: &str, reason: &str) -> bool {
        self.engine.cancel(transfer_id, reason)
    }

    /// Send a chat message, returns what was sent
    pub async fn send_chat(&self, peer_id: &PeerId, message: impl Into<String>) -> Result<ChatEntry> {
        let entry = ChatEntry {
            peer_id: self.local_id().clone(),
            id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
            timestamp: now_millis(),
        };
        self.manager
            .send(
                peer_id,
                &WireMessage::ChatMessage {
                    id: entry.id.clone(),
                    message: entry.message.clone(),
                    timestamp: entry.timestamp,
                },
            )
            .await?;
        debug!("Chat {} sent to {}", entry.id, peer_id);
        Ok(entry)
    }

    /// Received chat messages, oldest first
    pub async fn chat_log(&self) -> Vec<ChatEntry> {
        self.chat.snapshot().await
    }

    /// Subscribe to node events
    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.events.subscribe()
    }

    /// Register a synchronous observer
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.events.add_sink(sink);
    }

    pub fn analytics_snapshot(&self) -> AnalyticsSnapshot {
        self.analytics.snapshot()
    }

    /// Recover the signaling link in the background
    ///
    /// Returns `None` if recovery is already running.
    pub fn signaling_link_lost(&self) -> Option<JoinHandle<Result<u32>>> {
        self.reconnection.spawn(self.shutdown_token.child_token())
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.manager.is_connected(peer_id)
    }

    pub fn peer_info(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.manager.peer_info(peer_id)
    }

    /// Connected peers
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.manager.peers()
    }

    pub fn process_state(&self) -> ProcessState {
        self.manager.process_state()
    }

    /// Watch the process-wide state
    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.manager.subscribe_state()
    }

    pub fn active_transfers(&self) -> (usize, usize) {
        (self.engine.active_outbound(), self.engine.active_inbound())
    }

    /// Close every session and stop background tasks
    pub async fn shutdown(&self) -> Result<usize> {
        info!("Shutting down sharing node {}", self.local_id());
        self.shutdown_token.cancel();

        let closed = self.manager.shutdown().await?;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        info!("Sharing node {} stopped, {} sessions closed", self.local_id(), closed);
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopPersistence;
    use crate::memory::MemoryNetwork;

    fn node(net: &Arc<MemoryNetwork>, id: &str) -> (ShareNode, mpsc::UnboundedReceiver<IncomingChannel>) {
        let (signaling, incoming) = net.register(PeerId::parse(id).unwrap());
        let node = ShareNode::new(ShareConfig::new(id), signaling, Arc::new(NoopPersistence)).unwrap();
        (node, incoming)
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let net = MemoryNetwork::new();
        let (signaling, _incoming) = net.register(PeerId::parse("NODE0001").unwrap());
        let mut config = ShareConfig::new("NODE0001");
        config.chunk_size = 10;
        assert!(matches!(
            ShareNode::new(config, signaling, Arc::new(NoopPersistence)),
            Err(ShareError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_start_marks_ready() {
        let net = MemoryNetwork::new();
        let (node, _incoming) = node(&net, "NODE0001");
        assert_eq!(node.process_state(), ProcessState::Initializing);
        node.start().await.unwrap();
        node.start().await.unwrap();
        assert_eq!(node.process_state(), ProcessState::Ready);
        assert_eq!(node.shutdown().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_chat_log_dedups_and_bounds() {
        let log = ChatLog::new(2);
        let peer = PeerId::parse("PEER0001").unwrap();
        let entry = |id: &str| ChatEntry {
            peer_id: peer.clone(),
            id: id.to_string(),
            message: "hi".into(),
            timestamp: 1,
        };
        assert!(log.push(entry("a")).await);
        assert!(!log.push(entry("a")).await);
        assert!(log.push(entry("b")).await);
        assert!(log.push(entry("c")).await);
        let ids: Vec<String> = log.snapshot().await.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_fail() {
        let net = MemoryNetwork::new();
        let (node, _incoming) = node(&net, "NODE0001");
        node.start().await.unwrap();
        node.shutdown().await.unwrap();
        assert!(matches!(node.connect("NODE0002").await, Err(ShareError::Shutdown)));
        assert!(matches!(node.start().await, Err(ShareError::Shutdown)));
    }
}
