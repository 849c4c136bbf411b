use crate::protocol::{ConnectionId, MessageId, NetId, PrefabId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("Unknown message id: 0x{0:04x}")]
    UnknownMessage(MessageId),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Connection {connection_id} sent message 0x{message_id:04x} without being authenticated")]
    Unauthenticated {
        connection_id: ConnectionId,
        message_id: MessageId,
    },

    #[error("Connection {connection_id} sent local-only message 0x{message_id:04x}")]
    LocalOnlyMessage {
        connection_id: ConnectionId,
        message_id: MessageId,
    },

    #[error("Connection limit reached ({limit})")]
    ConnectionLimit { limit: usize },

    #[error("Connection {0} already exists")]
    DuplicateConnection(ConnectionId),

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Connection {0} is broken")]
    ConnectionBroken(ConnectionId),

    #[error("Message 0x{message_id:04x} ({size} bytes) does not fit a {capacity} byte send buffer")]
    MessageTooLarge {
        message_id: MessageId,
        size: usize,
        capacity: usize,
    },

    #[error("Transport send to connection {0} failed")]
    SendFailed(ConnectionId),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Entity is already spawned as {0}")]
    AlreadySpawned(NetId),

    #[error("Entity is not spawned")]
    NotSpawned,

    #[error("Unknown entity")]
    UnknownEntity,

    #[error("Unknown prefab: {0}")]
    UnknownPrefab(PrefabId),

    #[error("Prefab {0} is already registered")]
    DuplicatePrefab(PrefabId),

    #[error("Unknown netId: {0}")]
    UnknownNetId(NetId),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReplicationError {
    /// Protocol violations are fatal to the connection that caused them.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ReplicationError::UnknownMessage(_)
                | ReplicationError::MalformedFrame(_)
                | ReplicationError::Unauthenticated { .. }
                | ReplicationError::LocalOnlyMessage { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ReplicationError>;
