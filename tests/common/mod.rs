//! Shared harness for multi-node tests over the in-memory network

#![allow(dead_code)]

use silver_share::{
    IncomingChannel, MemoryNetwork, MemorySignaling, NoopPersistence, PeerId, ShareConfig, ShareEvent,
    ShareNode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Install a test subscriber once, honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A started node and its signaling handle
pub struct TestNode {
    pub node: Arc<ShareNode>,
    pub signaling: Arc<MemorySignaling>,
    pub listener: JoinHandle<()>,
}

impl TestNode {
    pub fn id(&self) -> PeerId {
        self.node.local_id().clone()
    }
}

/// Create a node on `net`, optionally starting its background tasks
pub async fn spawn_node(net: &Arc<MemoryNetwork>, id: &str, start: bool) -> TestNode {
    spawn_node_with(net, ShareConfig::new(id), start).await
}

pub async fn spawn_node_with(net: &Arc<MemoryNetwork>, config: ShareConfig, start: bool) -> TestNode {
    let peer_id = PeerId::parse(&config.local_id).unwrap();
    let (signaling, incoming): (Arc<MemorySignaling>, mpsc::UnboundedReceiver<IncomingChannel>) =
        net.register(peer_id);
    let node = Arc::new(ShareNode::new(config, signaling.clone(), Arc::new(NoopPersistence)).unwrap());
    if start {
        node.start().await.unwrap();
    }
    let listener = node.spawn_incoming_listener(incoming);
    TestNode {
        node,
        signaling,
        listener,
    }
}

/// Connect `a` to `b` and wait until both sides hold the session
pub async fn connect_pair(a: &TestNode, b: &TestNode) {
    a.node.connect(b.id().as_str()).await.unwrap();
    wait_until(|| b.node.is_connected(&a.id())).await;
}

/// Poll `condition` every 10ms, panics after a minute of (virtual) time
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..6000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Next event matching `pred`, skipping others and lag notices
pub async fn next_event<F>(rx: &mut broadcast::Receiver<ShareEvent>, pred: F) -> ShareEvent
where
    F: Fn(&ShareEvent) -> bool,
{
    loop {
        match rx.recv().await {
            Ok(event) if pred(&event) => return event,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
        }
    }
}

/// Drain everything currently queued
pub fn drain_events(rx: &mut broadcast::Receiver<ShareEvent>) -> Vec<ShareEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

/// Deterministic test payload
pub fn payload(len: usize) -> bytes::Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}
