pub mod analytics;
pub mod chunking;
pub mod config;
pub mod connection_manager;
pub mod error;
pub mod events;
pub mod health_monitor;
pub mod inbound_transfer;
pub mod memory;
pub mod node;
pub mod outbound_transfer;
pub mod peer_session;
pub mod reconnection_manager;
pub mod transfer_engine;
pub mod transport;
pub mod types;
pub mod wire;

pub use analytics::{AnalyticsAggregator, AnalyticsSnapshot, ConnectionEventKind, ConnectionRecord};
pub use chunking::{compute_checksum, split_into_chunks, Chunk, ReassemblyBuffer, VerifiedChunk};
pub use config::ShareConfig;
pub use connection_manager::{ConnectionManager, InboundHandler};
pub use error::{ErrorCategory, Result, ShareError};
pub use events::{ChatEntry, EventBus, EventSink, NoopPersistence, PersistenceHook, ShareEvent, TransferSummary};
pub use health_monitor::HealthMonitor;
pub use memory::{FrameAction, FrameFilter, MemoryNetwork, MemorySignaling};
pub use node::ShareNode;
pub use outbound_transfer::TransferHandle;
pub use reconnection_manager::ReconnectionManager;
pub use transfer_engine::{MessageSender, TransferEngine};
pub use transport::{ChannelEvent, IncomingChannel, OpenChannel, SignalingProvider, TransportChannel};
pub use types::{
    BackoffState, CloseReason, Direction, FileTransfer, Initiator, LeaveReason, PeerId, PeerInfo,
    PeerLifecycle, ProcessState, TransferMetadata, TransferStatus, PEER_ID_LEN,
};
pub use wire::WireMessage;
