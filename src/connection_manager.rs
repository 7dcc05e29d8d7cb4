//! Peer session lifecycle: connect, handshake, liveness and teardown
//!
//! Sessions live in a `DashMap` keyed by peer id. Every lifecycle transition of
//! a peer runs under that peer's `tokio::sync::Mutex`, so concurrent teardown
//! triggers clean up exactly once. `disconnect_all` takes the sweep gate in
//! write mode; per-peer transitions take it in read mode.

use crate::config::ShareConfig;
use crate::error::{Result, ShareError};
use crate::events::{EventBus, PersistenceHook, ShareEvent};
use crate::peer_session::PeerSession;
use crate::transport::{ChannelEvent, IncomingChannel, OpenChannel, SignalingProvider, TransportChannel};
use crate::types::{now_millis, CloseReason, Initiator, LeaveReason, PeerId, PeerInfo, PeerLifecycle, ProcessState};
use crate::wire::WireMessage;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives session traffic the connection manager does not handle itself
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Chat and transfer messages from an open session
    async fn handle_message(&self, peer_id: &PeerId, message: WireMessage);

    /// Session torn down, runs under the peer's lock
    async fn session_closed(&self, peer_id: &PeerId, reason: &CloseReason);
}

type DialResult = (&'static str, Result<OpenChannel>);

/// Owns every peer session
pub struct ConnectionManager {
    local_id: PeerId,
    /// Random id of this process, announced in `user-info`
    instance: String,
    config: ShareConfig,
    provider: Arc<dyn SignalingProvider>,
    /// Open sessions
    sessions: DashMap<PeerId, PeerSession>,
    /// Peers being dialled, with the dial start
    dialing: DashMap<PeerId, Instant>,
    /// Per-peer lifecycle locks
    peer_locks: DashMap<PeerId, Arc<Mutex<()>>>,
    /// Held in write mode by `disconnect_all`
    sweep_gate: RwLock<()>,
    next_channel_id: AtomicU64,
    events: Arc<EventBus>,
    persistence: Arc<dyn PersistenceHook>,
    handler: std::sync::RwLock<Option<Arc<dyn InboundHandler>>>,
    process_state: watch::Sender<ProcessState>,
}

impl ConnectionManager {
    /// Create new connection manager
    pub fn new(
        config: ShareConfig,
        provider: Arc<dyn SignalingProvider>,
        events: Arc<EventBus>,
        persistence: Arc<dyn PersistenceHook>,
    ) -> Result<Self> {
        config.validate()?;
        let local_id = config.local_peer_id()?;
        let (process_state, _) = watch::channel(ProcessState::Initializing);
        Ok(Self {
            local_id,
            instance: uuid::Uuid::new_v4().to_string(),
            config,
            provider,
            sessions: DashMap::new(),
            dialing: DashMap::new(),
            peer_locks: DashMap::new(),
            sweep_gate: RwLock::new(()),
            next_channel_id: AtomicU64::new(1),
            events,
            persistence,
            handler: std::sync::RwLock::new(None),
            process_state,
        })
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Route non-session traffic to `handler`
    pub fn register_handler(&self, handler: Arc<dyn InboundHandler>) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = Some(handler);
        }
    }

    /// Drop the registered handler
    pub fn clear_handler(&self) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = None;
        }
    }

    fn handler(&self) -> Option<Arc<dyn InboundHandler>> {
        self.handler.read().ok().and_then(|slot| slot.clone())
    }

    /// Watch the process-wide state
    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.process_state.subscribe()
    }

    pub fn process_state(&self) -> ProcessState {
        *self.process_state.borrow()
    }

    /// Leave `Initializing`
    pub fn mark_ready(&self) {
        self.publish_process_state();
    }

    fn publish_process_state(&self) {
        let count = self.sessions.len();
        let next = if count == 0 {
            ProcessState::Ready
        } else {
            ProcessState::Connected(count)
        };
        let changed = self.process_state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!("Process state: {:?}", next);
            self.events.emit(ShareEvent::ProcessStateChanged(next));
        }
    }

    fn peer_lock(&self, peer_id: &PeerId) -> Arc<Mutex<()>> {
        self.peer_locks
            .entry(peer_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the lock of a peer with no session once nobody else holds it
    fn prune_peer_lock(&self, peer_id: &PeerId) {
        if self.sessions.contains_key(peer_id) {
            return;
        }
        self.peer_locks
            .remove_if(peer_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// The channel initiated by the smaller peer id survives a simultaneous connect
    fn tie_break_winner(&self, peer_id: &PeerId) -> Initiator {
        if self.local_id < *peer_id {
            Initiator::Local
        } else {
            Initiator::Remote
        }
    }

    /// Open a session to `raw`
    pub async fn connect(self: &Arc<Self>, raw: &str) -> Result<PeerId> {
        let peer_id = PeerId::parse(raw)?;
        if peer_id == self.local_id {
            return Err(ShareError::SelfConnect(peer_id.to_string()));
        }
        if self.sessions.contains_key(&peer_id) {
            return Err(ShareError::AlreadyConnected(peer_id.to_string()));
        }
        match self.dialing.entry(peer_id.clone()) {
            Entry::Occupied(_) => return Err(ShareError::AlreadyConnected(peer_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
            }
        }

        info!("Connecting to peer: {}", peer_id);
        let dialed = self.dial(&peer_id).await;
        self.dialing.remove(&peer_id);

        let opened = match dialed {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Failed to connect to peer {}: {}", peer_id, e);
                return Err(e);
            }
        };

        self.install(peer_id.clone(), opened, Initiator::Local).await?;
        Ok(peer_id)
    }

    /// Race a primary dial against a delayed backup dial, first open channel wins
    async fn dial(&self, peer_id: &PeerId) -> Result<OpenChannel> {
        let timeout = self.config.connect_timeout(self.provider.low_bandwidth());
        let backup_delay = Duration::from_millis(
            rand::thread_rng().gen_range(self.config.backup_dial_min_ms..=self.config.backup_dial_max_ms),
        );

        let won = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<DialResult>(2);
        self.spawn_dial_attempt(peer_id.clone(), "primary", None, won.clone(), tx.clone());
        self.spawn_dial_attempt(peer_id.clone(), "backup", Some(backup_delay), won.clone(), tx);

        let race = async {
            let mut last_error = None;
            while let Some((label, result)) = rx.recv().await {
                match result {
                    Ok(opened) => {
                        debug!("{} dial to {} opened first", label, peer_id);
                        return Ok(opened);
                    }
                    Err(e) => {
                        debug!("{} dial to {} failed: {}", label, peer_id, e);
                        last_error = Some(e);
                    }
                }
            }
            Err(last_error.unwrap_or_else(|| ShareError::PeerUnreachable(peer_id.to_string())))
        };
        let outcome = tokio::time::timeout(timeout, race).await;

        won.cancel();
        rx.close();
        tokio::spawn(async move {
            while let Some((_, result)) = rx.recv().await {
                if let Ok(late) = result {
                    late.channel.close().await;
                }
            }
        });

        match outcome {
            Ok(result) => result,
            Err(_) => Err(ShareError::ConnectTimeout(peer_id.to_string(), timeout.as_secs())),
        }
    }

    fn spawn_dial_attempt(
        &self,
        peer_id: PeerId,
        label: &'static str,
        delay: Option<Duration>,
        won: CancellationToken,
        tx: mpsc::Sender<DialResult>,
    ) {
        let provider = self.provider.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::select! {
                    _ = won.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                debug!("Firing backup dial to {} after {}ms", peer_id, delay.as_millis());
            }

            let result = provider.open(&peer_id).await;
            if let Err(mpsc::error::SendError((_, Ok(late)))) = tx.send((label, result)).await {
                debug!("Closing late {} channel to {}", label, peer_id);
                late.channel.close().await;
            }
        });
    }

    /// Take over a channel opened by a remote peer
    pub async fn accept_incoming(self: &Arc<Self>, peer_id: PeerId, opened: OpenChannel) -> Result<()> {
        if peer_id == self.local_id {
            opened.channel.close().await;
            return Err(ShareError::SelfConnect(peer_id.to_string()));
        }
        debug!("Incoming channel from peer: {}", peer_id);
        self.install(peer_id, opened, Initiator::Remote).await
    }

    /// Forward a stream of incoming channels to `accept_incoming`
    pub fn spawn_incoming_listener(
        self: &Arc<Self>,
        mut incoming: mpsc::UnboundedReceiver<IncomingChannel>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = incoming.recv() => match next {
                        Some(IncomingChannel { peer_id, channel }) => {
                            if let Err(e) = manager.accept_incoming(peer_id.clone(), channel).await {
                                warn!("Rejected incoming channel from {}: {}", peer_id, e);
                            }
                        }
                        None => break,
                    }
                }
            }
            debug!("Incoming channel listener stopped");
        })
    }

    /// Make `opened` the session channel for `peer_id`, resolving duplicates
    async fn install(self: &Arc<Self>, peer_id: PeerId, opened: OpenChannel, initiator: Initiator) -> Result<()> {
        let installed = {
            let _gate = self.sweep_gate.read().await;
            let lock = self.peer_lock(&peer_id);
            let _guard = lock.lock().await;
            self.install_locked(&peer_id, opened, initiator).await
        };
        self.prune_peer_lock(&peer_id);
        installed
    }

    async fn install_locked(self: &Arc<Self>, peer_id: &PeerId, opened: OpenChannel, initiator: Initiator) -> Result<()> {
        let OpenChannel { channel, events } = opened;
        if !channel.is_open() {
            return Err(ShareError::ChannelClosed(peer_id.to_string()));
        }
        let channel_id = self.next_channel_id.fetch_add(1, Ordering::SeqCst);

        let existing = self
            .sessions
            .get(peer_id)
            .map(|s| (s.initiator, s.channel.is_open()));

        match existing {
            None => {
                self.sessions.insert(
                    peer_id.clone(),
                    PeerSession::new(peer_id.clone(), channel.clone(), channel_id, initiator),
                );
                info!("Session opened with peer {} ({:?} initiated)", peer_id, initiator);
                self.spawn_reader(peer_id.clone(), channel_id, events);
                self.send_user_info(peer_id, &channel).await;
                self.events.emit(ShareEvent::ConnectionOpened { peer_id: peer_id.clone() });
                self.publish_process_state();
            }
            Some((current, current_open)) => {
                let replace = if !current_open {
                    true
                } else if current == initiator {
                    false
                } else {
                    initiator == self.tie_break_winner(peer_id)
                };

                if replace {
                    let swapped = self
                        .sessions
                        .get_mut(peer_id)
                        .map(|mut s| s.swap_channel(channel.clone(), channel_id, initiator));
                    if let Some((old_channel, old_initiator)) = swapped {
                        self.retire_channel(old_channel, old_initiator == Initiator::Local);
                    }
                    info!(
                        "Session with peer {} moved to {:?} initiated channel {}",
                        peer_id, initiator, channel_id
                    );
                    self.spawn_reader(peer_id.clone(), channel_id, events);
                    self.send_user_info(peer_id, &channel).await;
                } else if initiator == Initiator::Remote {
                    debug!("Holding duplicate channel from peer {} until it settles", peer_id);
                    self.watch_duplicate(peer_id.clone(), OpenChannel { channel, events });
                } else {
                    debug!("Dropping duplicate local channel to peer {}", peer_id);
                    self.retire_channel(channel, true);
                }
            }
        }

        Ok(())
    }

    /// Close a superseded channel now, or after a grace period for its opener to close it
    fn retire_channel(&self, channel: Arc<dyn TransportChannel>, close_now: bool) {
        let grace = self.config.connect_timeout(false);
        tokio::spawn(async move {
            if !close_now {
                tokio::time::sleep(grace).await;
            }
            channel.close().await;
        });
    }

    /// Follow a duplicate channel the remote side opened
    ///
    /// A late dial or the losing half of a simultaneous connect is closed by its
    /// opener. A `user-info` from a new instance of the peer means it restarted
    /// and now uses this channel, so the session moves over to it.
    fn watch_duplicate(self: &Arc<Self>, peer_id: PeerId, opened: OpenChannel) {
        let manager = self.clone();
        let grace = self.config.connect_timeout(false);
        tokio::spawn(async move {
            let OpenChannel { channel, mut events } = opened;
            let watched = async {
                while let Some(event) = events.recv().await {
                    let frame = match event {
                        ChannelEvent::Message(frame) => frame,
                        _ => return None,
                    };
                    if let Ok(WireMessage::UserInfo {
                        display_name,
                        instance: Some(instance),
                    }) = WireMessage::decode(&frame)
                    {
                        if manager.is_new_instance(&peer_id, &instance) {
                            return Some((display_name, instance));
                        }
                    }
                }
                None
            };
            let restarted = tokio::time::timeout(grace, watched).await;

            match restarted {
                Ok(Some((display_name, instance))) => {
                    manager
                        .adopt_restarted(peer_id, OpenChannel { channel, events }, display_name, instance)
                        .await;
                }
                _ => channel.close().await,
            }
        });
    }

    fn is_new_instance(&self, peer_id: &PeerId, instance: &str) -> bool {
        self.sessions
            .get(peer_id)
            .and_then(|s| s.instance.clone())
            .map(|known| known != instance)
            .unwrap_or(false)
    }

    /// Move the session of a restarted peer onto the channel it opened
    async fn adopt_restarted(
        self: &Arc<Self>,
        peer_id: PeerId,
        opened: OpenChannel,
        display_name: Option<String>,
        instance: String,
    ) {
        let pending = {
            let _gate = self.sweep_gate.read().await;
            let lock = self.peer_lock(&peer_id);
            let _guard = lock.lock().await;
            self.adopt_locked(&peer_id, opened, display_name, instance).await
        };
        // The old session went away meanwhile, start a fresh one
        if let Some(opened) = pending {
            if let Err(e) = self.install(peer_id.clone(), opened, Initiator::Remote).await {
                debug!("Channel from restarted peer {} not installed: {}", peer_id, e);
            }
        }
        self.prune_peer_lock(&peer_id);
    }

    async fn adopt_locked(
        self: &Arc<Self>,
        peer_id: &PeerId,
        opened: OpenChannel,
        display_name: Option<String>,
        instance: String,
    ) -> Option<OpenChannel> {
        if !self.sessions.contains_key(peer_id) {
            return Some(opened);
        }
        let OpenChannel { channel, events } = opened;
        if !channel.is_open() {
            return None;
        }

        let channel_id = self.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let swapped = self.sessions.get_mut(peer_id).map(|mut s| {
            s.display_name = display_name.clone();
            s.instance = Some(instance);
            s.latency_ms = None;
            s.swap_channel(channel.clone(), channel_id, Initiator::Remote)
        });
        let (old_channel, _) = swapped?;

        info!("Peer {} restarted, session moved to channel {}", peer_id, channel_id);
        self.retire_channel(old_channel, true);
        // Transfers of the previous instance cannot finish
        if let Some(handler) = self.handler() {
            handler
                .session_closed(peer_id, &CloseReason::ChannelClosed("peer restarted".to_string()))
                .await;
        }
        self.spawn_reader(peer_id.clone(), channel_id, events);
        self.send_user_info(peer_id, &channel).await;
        self.events.emit(ShareEvent::PeerInfoUpdated {
            peer_id: peer_id.clone(),
            display_name,
        });
        None
    }

    async fn send_user_info(&self, peer_id: &PeerId, channel: &Arc<dyn TransportChannel>) {
        let hello = WireMessage::UserInfo {
            display_name: self.config.display_name.clone(),
            instance: Some(self.instance.clone()),
        };
        match hello.encode() {
            Ok(frame) => {
                if let Err(e) = channel.send(frame).await {
                    warn!("Failed to send handshake to {}: {}", peer_id, e);
                }
            }
            Err(e) => warn!("Failed to encode handshake: {}", e),
        }
    }

    fn is_current(&self, peer_id: &PeerId, channel_id: u64) -> bool {
        self.sessions
            .get(peer_id)
            .map(|s| s.channel_id == channel_id)
            .unwrap_or(false)
    }

    fn spawn_reader(
        self: &Arc<Self>,
        peer_id: PeerId,
        channel_id: u64,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ended = None;
            while let Some(event) = events.recv().await {
                if !manager.is_current(&peer_id, channel_id) {
                    // Superseded or torn down
                    match event {
                        ChannelEvent::Message(_) => continue,
                        _ => break,
                    }
                }
                match event {
                    ChannelEvent::Message(frame) => manager.handle_frame(&peer_id, channel_id, frame).await,
                    ChannelEvent::Closed(reason) => {
                        ended = Some(CloseReason::ChannelClosed(reason));
                        break;
                    }
                    ChannelEvent::Error(e) => {
                        warn!("Channel error from peer {}: {}", peer_id, e);
                        ended = Some(CloseReason::ChannelError(e));
                        break;
                    }
                }
            }
            let reason = ended.unwrap_or_else(|| CloseReason::ChannelClosed("event stream ended".to_string()));
            manager.teardown(&peer_id, Some(channel_id), reason).await;
            debug!("Reader for peer {} channel {} finished", peer_id, channel_id);
        });
    }

    async fn handle_frame(&self, peer_id: &PeerId, channel_id: u64, frame: Bytes) {
        let revived = match self.sessions.get_mut(peer_id) {
            Some(mut session) if session.channel_id == channel_id => session.touch(),
            _ => return,
        };
        if revived {
            debug!("Peer {} is responsive again", peer_id);
        }

        let message = match WireMessage::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable frame from {}: {}", peer_id, e);
                return;
            }
        };

        match message {
            WireMessage::HealthCheck { timestamp } => {
                if let Err(e) = self.send(peer_id, &WireMessage::HealthCheckResponse { timestamp }).await {
                    debug!("Failed to answer health check from {}: {}", peer_id, e);
                }
            }
            WireMessage::HealthCheckResponse { timestamp } => {
                let latency = now_millis().saturating_sub(timestamp);
                if let Some(mut session) = self.sessions.get_mut(peer_id) {
                    session.latency_ms = Some(latency);
                }
                debug!("Health check response from {} (latency: {}ms)", peer_id, latency);
            }
            WireMessage::UserInfo { display_name, instance } => {
                if let Some(mut session) = self.sessions.get_mut(peer_id) {
                    session.display_name = display_name.clone();
                    if instance.is_some() {
                        session.instance = instance;
                    }
                }
                debug!("Peer {} announced name {:?}", peer_id, display_name);
                self.events.emit(ShareEvent::PeerInfoUpdated {
                    peer_id: peer_id.clone(),
                    display_name,
                });
            }
            WireMessage::PeerLeaving { reason, .. } => {
                info!("Peer {} is leaving ({})", peer_id, reason);
                self.teardown(peer_id, Some(channel_id), CloseReason::RemoteLeft(reason))
                    .await;
            }
            other => match self.handler() {
                Some(handler) => handler.handle_message(peer_id, other).await,
                None => debug!("No handler for {} from {}", other.kind(), peer_id),
            },
        }
    }

    /// Send a message over the peer's session
    pub async fn send(&self, peer_id: &PeerId, message: &WireMessage) -> Result<()> {
        let channel = self
            .sessions
            .get(peer_id)
            .map(|s| s.channel.clone())
            .ok_or_else(|| ShareError::PeerNotConnected(peer_id.to_string()))?;
        let frame = message.encode()?;
        channel.send(frame).await
    }

    /// Tell the peer we are leaving and close the session
    ///
    /// Returns false if there was no session to close.
    pub async fn disconnect(&self, peer_id: &PeerId, reason: LeaveReason) -> Result<bool> {
        let _gate = self.sweep_gate.read().await;
        self.disconnect_locked(peer_id, reason, CloseReason::LocalDisconnect(reason))
            .await
    }

    /// Disconnect every peer, returns the number of sessions closed
    pub async fn disconnect_all(&self, reason: LeaveReason) -> Result<usize> {
        self.sweep_sessions(reason, CloseReason::LocalDisconnect(reason)).await
    }

    /// Close every session for node shutdown
    pub async fn shutdown(&self) -> Result<usize> {
        let closed = self
            .sweep_sessions(LeaveReason::Programmatic, CloseReason::Shutdown)
            .await?;
        self.clear_handler();
        Ok(closed)
    }

    async fn sweep_sessions(&self, leave: LeaveReason, close: CloseReason) -> Result<usize> {
        let _gate = self.sweep_gate.write().await;
        let peers: Vec<PeerId> = self.sessions.iter().map(|s| s.key().clone()).collect();
        info!("Disconnecting {} peers ({})", peers.len(), close);

        let mut closed = 0;
        for peer_id in peers {
            if self.disconnect_locked(&peer_id, leave, close.clone()).await? {
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn disconnect_locked(&self, peer_id: &PeerId, leave: LeaveReason, close: CloseReason) -> Result<bool> {
        let closed = {
            let lock = self.peer_lock(peer_id);
            let _guard = lock.lock().await;
            self.notify_and_remove(peer_id, leave, close).await
        };
        self.prune_peer_lock(peer_id);
        closed
    }

    /// Caller holds the peer's lock
    async fn notify_and_remove(&self, peer_id: &PeerId, leave: LeaveReason, close: CloseReason) -> Result<bool> {
        let channel = match self.sessions.get(peer_id) {
            Some(session) => session.channel.clone(),
            None => {
                debug!("Disconnect of {} ignored, no session", peer_id);
                return Ok(false);
            }
        };

        let leaving = WireMessage::PeerLeaving {
            reason: leave,
            timestamp: now_millis(),
        };
        if let Err(e) = channel.send(leaving.encode()?).await {
            debug!("Could not notify peer {} of disconnect: {}", peer_id, e);
        }

        Ok(self.remove_session_locked(peer_id, None, close).await)
    }

    /// Tear down a session, returns true if this call removed it
    async fn teardown(&self, peer_id: &PeerId, channel_id: Option<u64>, reason: CloseReason) -> bool {
        let removed = {
            let _gate = self.sweep_gate.read().await;
            let lock = self.peer_lock(peer_id);
            let _guard = lock.lock().await;
            self.remove_session_locked(peer_id, channel_id, reason).await
        };
        self.prune_peer_lock(peer_id);
        removed
    }

    /// Caller holds the peer's lock
    async fn remove_session_locked(&self, peer_id: &PeerId, channel_id: Option<u64>, reason: CloseReason) -> bool {
        let removed = match channel_id {
            Some(id) => self.sessions.remove_if(peer_id, |_, s| s.channel_id == id),
            None => self.sessions.remove(peer_id),
        };
        let mut session = match removed {
            Some((_, session)) => session,
            None => return false,
        };

        session.state = PeerLifecycle::Closed;
        session.channel.close().await;
        if reason.is_intentional() {
            info!("Session with peer {} closed: {}", peer_id, reason);
        } else {
            warn!("Session with peer {} lost: {}", peer_id, reason);
        }

        if let Some(handler) = self.handler() {
            handler.session_closed(peer_id, &reason).await;
        }
        if let Err(e) = self.persistence.peer_removed(peer_id, &reason).await {
            warn!("Persistence hook failed for peer {}: {}", peer_id, e);
        }

        self.events.emit(ShareEvent::ConnectionClosed {
            peer_id: peer_id.clone(),
            reason,
        });
        self.publish_process_state();
        true
    }

    /// Probe sessions silent for at least `soft_timeout`, returns the number probed
    pub async fn heartbeat_tick(&self, soft_timeout: Duration) -> usize {
        let mut due = Vec::new();
        for mut session in self.sessions.iter_mut() {
            if session.silence() >= soft_timeout {
                session.mark_stale();
                due.push((session.key().clone(), session.channel.clone()));
            }
        }

        for (peer_id, channel) in &due {
            let probe = WireMessage::HealthCheck { timestamp: now_millis() };
            match probe.encode() {
                Ok(frame) => {
                    if let Err(e) = channel.send(frame).await {
                        debug!("Failed to send health check to {}: {}", peer_id, e);
                    } else {
                        debug!("Sent health check to stale peer {}", peer_id);
                    }
                }
                Err(e) => warn!("Failed to encode health check: {}", e),
            }
        }
        due.len()
    }

    /// Tear down sessions silent longer than `hard_timeout`, returns the number removed
    pub async fn liveness_sweep(&self, hard_timeout: Duration) -> usize {
        let expired: Vec<(PeerId, u64, Duration)> = self
            .sessions
            .iter()
            .filter(|s| s.silence() > hard_timeout)
            .map(|s| (s.key().clone(), s.channel_id, s.silence()))
            .collect();

        let mut removed = 0;
        for (peer_id, channel_id, silence) in expired {
            let err = ShareError::LivenessTimeout(peer_id.to_string(), silence.as_secs());
            warn!("{}", err);
            if self
                .teardown(&peer_id, Some(channel_id), CloseReason::LivenessTimeout)
                .await
            {
                removed += 1;
            }
        }
        removed
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.sessions.contains_key(peer_id)
    }

    pub fn is_dialing(&self, peer_id: &PeerId) -> bool {
        self.dialing.contains_key(peer_id)
    }

    /// Lifecycle of a peer as seen from here
    pub fn lifecycle(&self, peer_id: &PeerId) -> PeerLifecycle {
        if let Some(session) = self.sessions.get(peer_id) {
            return session.state;
        }
        if self.dialing.contains_key(peer_id) {
            return PeerLifecycle::Connecting;
        }
        PeerLifecycle::Disconnected
    }

    pub fn peer_info(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.sessions.get(peer_id).map(|s| s.info())
    }

    /// Snapshot of all sessions
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.sessions.iter().map(|s| s.info()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Id of the channel currently carrying the peer's session
    pub fn channel_id(&self, peer_id: &PeerId) -> Option<u64> {
        self.sessions.get(peer_id).map(|s| s.channel_id)
    }
}
