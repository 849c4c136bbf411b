use crate::error::{ReplicationError, Result};
use crate::protocol::ConnectionId;
use crate::world::EntityKey;
use ahash::{AHashMap, AHashSet};

#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub connection_id: ConnectionId,
    pub authenticated: bool,
    pub joined_world: bool,
    pub owned_entities: AHashSet<EntityKey>,
    /// Sticky send-failure flag. Suppresses sends until the transport
    /// reports the disconnect.
    pub broken: bool,
}

impl ConnectionState {
    pub fn new(connection_id: ConnectionId, authenticated: bool) -> Self {
        Self {
            connection_id,
            authenticated,
            joined_world: false,
            owned_entities: AHashSet::new(),
            broken: false,
        }
    }

    pub fn owns(&self, key: EntityKey) -> bool {
        self.owned_entities.contains(&key)
    }
}

pub struct ConnectionRegistry {
    connections: AHashMap<ConnectionId, ConnectionState>,
    limit: usize,
}

impl ConnectionRegistry {
    pub fn new(limit: usize) -> Self {
        Self {
            connections: AHashMap::new(),
            limit,
        }
    }

    pub fn add(&mut self, connection_id: ConnectionId, authenticated: bool) -> Result<&mut ConnectionState> {
        if self.connections.contains_key(&connection_id) {
            return Err(ReplicationError::DuplicateConnection(connection_id));
        }

        if self.connections.len() >= self.limit {
            return Err(ReplicationError::ConnectionLimit { limit: self.limit });
        }

        Ok(self.connections
            .entry(connection_id)
            .or_insert_with(|| ConnectionState::new(connection_id, authenticated)))
    }

    pub fn remove(&mut self, connection_id: ConnectionId) -> Option<ConnectionState> {
        self.connections.remove(&connection_id)
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<&ConnectionState> {
        self.connections.get(&connection_id)
    }

    pub fn get_mut(&mut self, connection_id: ConnectionId) -> Option<&mut ConnectionState> {
        self.connections.get_mut(&connection_id)
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.connections.contains_key(&connection_id)
    }

    pub fn is_authenticated(&self, connection_id: ConnectionId) -> bool {
        self.connections
            .get(&connection_id)
            .map(|connection| connection.authenticated)
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionState> {
        self.connections.values()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
