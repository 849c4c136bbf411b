pub mod protocol;
pub mod transport;
pub mod serialization;
pub mod compression;
pub mod connection;
pub mod dispatch;
pub mod batch;
pub mod world;
pub mod prefab;
pub mod interval;
pub mod interest;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod error;
pub mod debug;

#[cfg(feature = "async")]
pub mod driver;

pub use protocol::{
    ConnectionId, MessageId, NetId, PrefabId,
    NetworkMessage, MessageHeader, message_ids, message_name,
    ConnectMessage, DisconnectMessage, SpawnMessage, UnspawnMessage, TransformMessage,
};

pub use serialization::{
    NetworkWriter, NetworkReader,
};

pub use transport::{
    Transport, TransportEvent, Channel, MemoryTransport, SentPacket, LOCAL_CONNECTION,
};

pub use compression::{
    compress_quaternion, decompress_quaternion, angular_distance,
};

pub use connection::{
    ConnectionState, ConnectionRegistry,
};

pub use dispatch::{
    AuthContext, MessageRouter,
};

pub use batch::{
    MessageSender, SendStats, messages_per_chunk,
};

pub use world::{
    EntityKey, NetworkEntity, NetworkTransform, SyncDirection, World,
};

pub use prefab::{
    Prefab, PrefabRegistry,
};

pub use interval::IntervalTimer;

pub use interest::{
    InterestManagement, InterestConfig, InterestStats,
    ObserverStrategy, DistanceInterest, EyeIndex, OutgoingQueue,
};

pub use broadcast::{
    StateBroadcast, ClientStateBroadcast, BroadcastConfig, BroadcastStats,
    StateCollector, TransformCollector,
};

pub use server::{
    ServerSession, ServerState, ServerConfig, ServerEvent, SessionStats,
};

pub use client::{
    ClientSession, ClientState, ClientConfig, ClientEvent, ClientStats, ConnectState,
};

pub use error::{
    ReplicationError, Result,
};

pub use debug::{
    DebugFlags, init_debug_mode, is_debug_enabled, is_trace_enabled,
    log_message, trace_rebuild,
    trace_transport_send, trace_transport_receive,
    format_bytes, message_summary,
};

#[cfg(feature = "async")]
pub use driver::{
    Tick, run_tick_loop,
};
