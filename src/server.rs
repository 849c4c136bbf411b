//! Server session: connection lifecycle, message dispatch and the per-tick
//! interest and broadcast passes.

use crate::batch::{MessageSender, SendStats};
use crate::broadcast::{BroadcastConfig, BroadcastStats, StateBroadcast, StateCollector, TransformCollector};
use crate::compression::decompress_quaternion;
use crate::connection::{ConnectionRegistry, ConnectionState};
use crate::debug;
use crate::dispatch::{AuthContext, MessageRouter};
use crate::error::{ReplicationError, Result};
use crate::interest::{DistanceInterest, InterestConfig, InterestManagement, InterestStats, ObserverStrategy};
use crate::protocol::{
    message_ids, ConnectMessage, ConnectionId, DisconnectMessage, MessageHeader, NetId, NetworkMessage, PrefabId,
    TransformMessage, UnspawnMessage,
};
use crate::prefab::PrefabRegistry;
use crate::serialization::NetworkReader;
use crate::transport::{Channel, Transport, TransportEvent};
use crate::world::{EntityKey, NetworkEntity, World};
use ahash::AHashMap;
use bytes::Bytes;
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub connection_limit: usize,
    /// Upper bound for one frame; the transport's packet size caps it further.
    pub send_buffer_capacity: usize,
    /// New connections start authenticated. An authenticator revokes trust
    /// with `set_authenticated`.
    pub authenticate_by_default: bool,
    pub interest: InterestConfig,
    pub broadcast: BroadcastConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection_limit: 1000,
            send_buffer_capacity: 1200,
            authenticate_by_default: true,
            interest: InterestConfig::default(),
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_limit(mut self, limit: usize) -> Self {
        self.connection_limit = limit;
        self
    }

    pub fn with_send_buffer_capacity(mut self, capacity: usize) -> Self {
        self.send_buffer_capacity = capacity;
        self
    }

    pub fn with_authenticate_by_default(mut self, enabled: bool) -> Self {
        self.authenticate_by_default = enabled;
        self
    }

    pub fn with_interest(mut self, interest: InterestConfig) -> Self {
        self.interest = interest;
        self
    }

    pub fn with_broadcast(mut self, broadcast: BroadcastConfig) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.send_buffer_capacity <= MessageHeader::SIZE {
            return Err(ReplicationError::InvalidConfig(format!(
                "send_buffer_capacity must exceed the {} byte frame header, got {}",
                MessageHeader::SIZE,
                self.send_buffer_capacity
            )));
        }

        self.interest.validate()?;
        self.broadcast.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    Connected(ConnectionId),
    Disconnected(ConnectionId),
}

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub send: SendStats,
    pub interest: InterestStats,
    pub broadcast: BroadcastStats,
    pub connections: usize,
    pub spawned: usize,
}

/// Everything message handlers may touch. Kept apart from the router and the
/// engines so a handler can borrow it mutably while the router is borrowed.
pub struct ServerState<T: Transport> {
    world: World,
    registry: ConnectionRegistry,
    spawned: AHashMap<NetId, EntityKey>,
    sender: MessageSender<T>,
    prefabs: PrefabRegistry,
    events: Vec<ServerEvent>,
}

impl<T: Transport> AuthContext for ServerState<T> {
    fn is_authenticated(&self, connection_id: ConnectionId) -> bool {
        self.registry.is_authenticated(connection_id)
    }
}

impl<T: Transport> ServerState<T> {
    fn new(transport: T, prefabs: PrefabRegistry, config: &ServerConfig) -> Self {
        Self {
            world: World::new(),
            registry: ConnectionRegistry::new(config.connection_limit),
            spawned: AHashMap::new(),
            sender: MessageSender::new(transport, config.send_buffer_capacity),
            prefabs,
            events: Vec::new(),
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn prefabs(&self) -> &PrefabRegistry {
        &self.prefabs
    }

    pub fn connection(&self, connection_id: ConnectionId) -> Option<&ConnectionState> {
        self.registry.get(connection_id)
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        self.sender.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.sender.transport_mut()
    }

    pub fn entity_key(&self, net_id: NetId) -> Option<EntityKey> {
        self.spawned.get(&net_id).copied()
    }

    pub fn entity(&self, net_id: NetId) -> Option<&NetworkEntity> {
        self.entity_key(net_id).and_then(|key| self.world.get(key))
    }

    pub fn spawned_count(&self) -> usize {
        self.spawned.len()
    }

    pub fn push_event(&mut self, event: ServerEvent) {
        self.events.push(event);
    }

    /// Assigns a netId and records ownership. Observers are picked up by the
    /// next scheduled rebuild.
    pub fn spawn(&mut self, key: EntityKey, owner: Option<ConnectionId>) -> Result<NetId> {
        let entity = self.world.get_mut(key).ok_or(ReplicationError::UnknownEntity)?;

        if entity.is_spawned() {
            tracing::warn!("Entity {:?} is already spawned as netId {}", key, entity.net_id);
            return Err(ReplicationError::AlreadySpawned(entity.net_id));
        }

        if let Some(owner) = owner {
            let connection = self.registry
                .get_mut(owner)
                .ok_or(ReplicationError::UnknownConnection(owner))?;
            connection.owned_entities.insert(key);
        }

        let net_id = key.to_net_id();
        entity.net_id = net_id;
        entity.connection_id = owner;
        entity.observers.clear();
        self.spawned.insert(net_id, key);

        tracing::debug!("Spawned netId {} (prefab {}) owner={:?}", net_id, entity.prefab_id, owner);

        Ok(net_id)
    }

    /// Instantiates a prefab into the world and spawns it.
    pub fn spawn_prefab(
        &mut self,
        prefab_id: &PrefabId,
        position: Vec3,
        rotation: Quat,
        owner: Option<ConnectionId>,
    ) -> Result<EntityKey> {
        let entity = self.prefabs.instantiate(prefab_id, position, rotation)?;
        let key = self.world.insert(entity);

        if let Err(e) = self.spawn(key, owner) {
            self.world.remove(key);
            return Err(e);
        }

        Ok(key)
    }

    /// Spawns `key` as the connection's player entity.
    pub fn join_world(&mut self, connection_id: ConnectionId, key: EntityKey) -> Result<NetId> {
        if !self.registry.contains(connection_id) {
            return Err(ReplicationError::UnknownConnection(connection_id));
        }

        let net_id = self.spawn(key, Some(connection_id))?;

        if let Some(connection) = self.registry.get_mut(connection_id) {
            connection.joined_world = true;
        }
        tracing::info!("Connection {} joined the world as netId {}", connection_id, net_id);

        Ok(net_id)
    }

    /// Tells every current observer to drop the entity, then clears its
    /// ownership and netId. Later rebuilds no longer see it.
    pub fn unspawn(&mut self, key: EntityKey) -> Result<()> {
        let entity = self.world.get_mut(key).ok_or(ReplicationError::UnknownEntity)?;

        if !entity.is_spawned() {
            tracing::warn!("Unspawn of entity {:?} which is not spawned", key);
            return Err(ReplicationError::NotSpawned);
        }

        let net_id = entity.net_id;
        self.spawned.remove(&net_id);

        let unspawn = [UnspawnMessage { net_id }];
        for observer in entity.observers.drain(..) {
            let Some(connection) = self.registry.get_mut(observer) else {
                continue;
            };

            match self.sender.send_batch(connection, &unspawn, Channel::Reliable) {
                Ok(_) | Err(ReplicationError::ConnectionBroken(_)) => {}
                Err(e) => tracing::debug!("Unspawn of {} to connection {} failed: {}", net_id, observer, e),
            }
        }

        if let Some(owner) = entity.connection_id.take() {
            if let Some(connection) = self.registry.get_mut(owner) {
                connection.owned_entities.remove(&key);
            }
        }

        entity.net_id = NetId::NONE;
        tracing::debug!("Unspawned netId {}", net_id);

        Ok(())
    }

    /// Unspawns the entity if needed and removes it from the world.
    pub fn destroy(&mut self, key: EntityKey) -> Result<NetworkEntity> {
        let spawned = self.world
            .get(key)
            .map(NetworkEntity::is_spawned)
            .ok_or(ReplicationError::UnknownEntity)?;

        if spawned {
            self.unspawn(key)?;
        }

        self.world.remove(key).ok_or(ReplicationError::UnknownEntity)
    }

    /// Sends one message to one connection in a single-message frame.
    pub fn send<M: NetworkMessage>(&mut self, connection_id: ConnectionId, message: &M, channel: Channel) -> Result<()> {
        let connection = self.registry
            .get_mut(connection_id)
            .ok_or(ReplicationError::UnknownConnection(connection_id))?;

        self.sender
            .send_batch(connection, std::slice::from_ref(message), channel)
            .map(|_| ())
    }

    /// Asks the transport to drop the connection. Cleanup runs when the
    /// transport reports the disconnect.
    pub fn disconnect(&mut self, connection_id: ConnectionId) {
        if self.registry.contains(connection_id) {
            self.sender.transport_mut().disconnect(Some(connection_id));
        } else {
            tracing::debug!("Disconnect requested for unknown connection {}", connection_id);
        }
    }

    pub fn set_authenticated(&mut self, connection_id: ConnectionId, authenticated: bool) -> Result<()> {
        let connection = self.registry
            .get_mut(connection_id)
            .ok_or(ReplicationError::UnknownConnection(connection_id))?;

        connection.authenticated = authenticated;
        Ok(())
    }

    fn apply_client_transform(&mut self, connection_id: ConnectionId, message: TransformMessage) {
        let Some(entity) = self.spawned
            .get(&message.net_id)
            .and_then(|key| self.world.get_mut(*key))
        else {
            tracing::warn!(
                "Connection {} sent a transform for unknown netId {}",
                connection_id, message.net_id
            );
            return;
        };

        if entity.connection_id != Some(connection_id) || !entity.is_client_authoritative() {
            tracing::warn!(
                "Connection {} sent a transform for netId {} it has no authority over",
                connection_id, message.net_id
            );
            return;
        }

        entity.position = message.position;
        entity.rotation = decompress_quaternion(message.rotation);
    }
}

pub struct ServerSession<
    T: Transport,
    S: ObserverStrategy = DistanceInterest,
    C: StateCollector = TransformCollector,
> {
    state: ServerState<T>,
    router: MessageRouter<ServerState<T>>,
    interest: InterestManagement<S>,
    broadcast: StateBroadcast<C>,
    config: ServerConfig,
    now: f64,
}

impl<T: Transport> ServerSession<T> {
    pub fn new(transport: T, prefabs: PrefabRegistry, config: ServerConfig) -> Result<Self> {
        let strategy = DistanceInterest::new(config.interest.visibility_radius);
        Self::with_strategy(transport, prefabs, config, strategy, TransformCollector)
    }
}

impl<T: Transport, S: ObserverStrategy, C: StateCollector> ServerSession<T, S, C> {
    pub fn with_strategy(
        transport: T,
        prefabs: PrefabRegistry,
        config: ServerConfig,
        strategy: S,
        collector: C,
    ) -> Result<Self> {
        config.validate()?;

        if config.authenticate_by_default {
            tracing::warn!(
                "authenticate_by_default is on: connections are trusted until an authenticator calls set_authenticated"
            );
        }

        let state = ServerState::new(transport, prefabs, &config);
        tracing::info!(
            "Server session started (limit {}, send buffer {} bytes)",
            config.connection_limit,
            state.sender.capacity()
        );

        let mut session = Self {
            state,
            router: MessageRouter::new(),
            interest: InterestManagement::with_strategy(config.interest.update_interval, strategy),
            broadcast: StateBroadcast::with_collector(&config.broadcast, collector),
            config,
            now: 0.0,
        };

        session.register_default_handlers();
        Ok(session)
    }

    fn register_default_handlers(&mut self) {
        self.router.register::<ConnectMessage, _>(false, |state: &mut ServerState<T>, connection_id, _| {
            tracing::info!("Connection {} connected", connection_id);
            state.push_event(ServerEvent::Connected(connection_id));
        });

        self.router.register::<DisconnectMessage, _>(false, |state: &mut ServerState<T>, connection_id, _| {
            tracing::info!("Connection {} disconnected", connection_id);
            state.push_event(ServerEvent::Disconnected(connection_id));
        });

        self.router.register::<TransformMessage, _>(true, |state: &mut ServerState<T>, connection_id, message| {
            state.apply_client_transform(connection_id, message);
        });
    }

    /// Registers a handler for an application message, replacing any handler
    /// already bound to `M::ID`.
    pub fn register_handler<M, F>(&mut self, requires_authentication: bool, handler: F)
    where
        M: NetworkMessage,
        F: Fn(&mut ServerState<T>, ConnectionId, M) + 'static,
    {
        self.router.register::<M, F>(requires_authentication, handler);
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> &ServerState<T> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ServerState<T> {
        &mut self.state
    }

    pub fn world(&self) -> &World {
        &self.state.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.state.world
    }

    pub fn transport(&self) -> &T {
        self.state.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.state.transport_mut()
    }

    pub fn connection(&self, connection_id: ConnectionId) -> Option<&ConnectionState> {
        self.state.connection(connection_id)
    }

    pub fn spawn(&mut self, key: EntityKey, owner: Option<ConnectionId>) -> Result<NetId> {
        self.state.spawn(key, owner)
    }

    pub fn spawn_prefab(
        &mut self,
        prefab_id: &PrefabId,
        position: Vec3,
        rotation: Quat,
        owner: Option<ConnectionId>,
    ) -> Result<EntityKey> {
        self.state.spawn_prefab(prefab_id, position, rotation, owner)
    }

    pub fn join_world(&mut self, connection_id: ConnectionId, key: EntityKey) -> Result<NetId> {
        self.state.join_world(connection_id, key)
    }

    pub fn unspawn(&mut self, key: EntityKey) -> Result<()> {
        self.state.unspawn(key)
    }

    pub fn destroy(&mut self, key: EntityKey) -> Result<NetworkEntity> {
        self.state.destroy(key)
    }

    pub fn send<M: NetworkMessage>(&mut self, connection_id: ConnectionId, message: &M, channel: Channel) -> Result<()> {
        self.state.send(connection_id, message, channel)
    }

    pub fn disconnect(&mut self, connection_id: ConnectionId) {
        self.state.disconnect(connection_id);
    }

    pub fn set_authenticated(&mut self, connection_id: ConnectionId, authenticated: bool) -> Result<()> {
        self.state.set_authenticated(connection_id, authenticated)
    }

    pub fn take_events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.state.events)
    }

    /// One server tick: drain transport events, then run interest management
    /// and the state broadcast on their own intervals.
    pub fn update(&mut self, now: f64) {
        self.now = now;

        while let Some(event) = self.state.sender.transport_mut().poll_event() {
            self.handle_transport_event(event);
        }

        let state = &mut self.state;
        self.interest.update(now, &mut state.world, &mut state.registry, &mut state.sender);
        self.broadcast.update(now, &state.world, &mut state.registry, &mut state.sender);
    }

    /// Forces a full interest rebuild outside the interval timer.
    pub fn rebuild_now(&mut self) {
        let state = &mut self.state;
        self.interest.rebuild_now(self.now, &mut state.world, &mut state.registry, &mut state.sender);
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(connection_id) => self.handle_connected(connection_id),
            TransportEvent::Data { connection_id, payload, .. } => self.handle_data(connection_id, payload),
            TransportEvent::Disconnected(connection_id) => self.handle_disconnected(connection_id),
        }
    }

    fn handle_connected(&mut self, connection_id: ConnectionId) {
        if let Err(e) = self.state.registry.add(connection_id, self.config.authenticate_by_default) {
            tracing::warn!("Rejecting connection {}: {}", connection_id, e);
            self.state.sender.transport_mut().disconnect(Some(connection_id));
            return;
        }

        if let Err(e) = self.router.invoke(&mut self.state, connection_id, &ConnectMessage) {
            tracing::error!("Connect handler for connection {} failed: {}", connection_id, e);
        }
    }

    fn handle_data(&mut self, connection_id: ConnectionId, payload: Bytes) {
        debug::trace_transport_receive(payload.len(), connection_id);

        if !self.state.registry.contains(connection_id) {
            tracing::debug!("Dropping {} from unknown connection {}", debug::format_bytes(payload.len()), connection_id);
            return;
        }

        let mut reader = NetworkReader::new(&payload);

        let result = match reader.read_message_id() {
            None => Err(ReplicationError::MalformedFrame("frame shorter than a message id".to_string())),
            Some(message_id) if message_ids::is_local_only(message_id) => Err(ReplicationError::LocalOnlyMessage {
                connection_id,
                message_id,
            }),
            Some(message_id) => self.router
                .dispatch(&mut self.state, connection_id, message_id, &mut reader)
                .and_then(|_| {
                    if reader.is_empty() {
                        Ok(())
                    } else {
                        Err(ReplicationError::MalformedFrame(format!(
                            "{} trailing bytes after message 0x{:04x}",
                            reader.remaining(),
                            message_id
                        )))
                    }
                }),
        };

        if let Err(e) = result {
            tracing::warn!("Disconnecting connection {}: {}", connection_id, e);
            self.state.disconnect(connection_id);
        }
    }

    fn handle_disconnected(&mut self, connection_id: ConnectionId) {
        if !self.state.registry.contains(connection_id) {
            tracing::debug!("Ignoring disconnect of unregistered connection {}", connection_id);
            return;
        }

        // Handlers run while the connection and its entities still exist.
        if let Err(e) = self.router.invoke(&mut self.state, connection_id, &DisconnectMessage) {
            tracing::error!("Disconnect handler for connection {} failed: {}", connection_id, e);
        }

        let mut owned: Vec<EntityKey> = match self.state.registry.get_mut(connection_id) {
            Some(connection) => {
                connection.broken = true;
                connection.owned_entities.iter().copied().collect()
            }
            None => Vec::new(),
        };
        owned.sort_unstable();

        for key in owned {
            if let Err(e) = self.state.destroy(key) {
                tracing::debug!("Cleanup of {:?} for connection {} failed: {}", key, connection_id, e);
            }
        }

        self.state.registry.remove(connection_id);
        self.rebuild_now();
    }

    pub fn get_stats(&self) -> SessionStats {
        SessionStats {
            send: self.state.sender.get_stats().clone(),
            interest: self.interest.get_stats().clone(),
            broadcast: self.broadcast.get_stats().clone(),
            connections: self.state.registry.len(),
            spawned: self.state.spawned.len(),
        }
    }
}
