//! Client session: connection state machine and application of server
//! spawn, unspawn and transform traffic to the local world.

use crate::batch::{MessageSender, SendStats};
use crate::broadcast::{BroadcastConfig, BroadcastStats, ClientStateBroadcast, StateCollector, TransformCollector};
use crate::compression::decompress_quaternion;
use crate::debug;
use crate::dispatch::{AuthContext, MessageRouter};
use crate::error::{ReplicationError, Result};
use crate::prefab::PrefabRegistry;
use crate::protocol::{
    ConnectionId, MessageHeader, NetId, NetworkMessage, SpawnMessage, TransformMessage, UnspawnMessage,
};
use crate::serialization::NetworkReader;
use crate::transport::{Channel, Transport, TransportEvent, LOCAL_CONNECTION};
use crate::world::{EntityKey, NetworkEntity, World};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Upper bound on zero-size bodies in one frame, which carry no bytes to check the count against.
const MAX_EMPTY_BODIES_PER_FRAME: usize = u16::MAX as usize;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub send_buffer_capacity: usize,
    /// Keep the last received entities in the world after a disconnect.
    pub freeze_scene_on_disconnect: bool,
    pub broadcast: BroadcastConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            send_buffer_capacity: 1200,
            freeze_scene_on_disconnect: false,
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_send_buffer_capacity(mut self, capacity: usize) -> Self {
        self.send_buffer_capacity = capacity;
        self
    }

    pub fn with_freeze_scene_on_disconnect(mut self, freeze: bool) -> Self {
        self.freeze_scene_on_disconnect = freeze;
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
        if self.send_buffer_capacity <= 2 {
            return Err(ReplicationError::InvalidConfig(format!(
                "send_buffer_capacity must exceed the 2 byte message id, got {}",
                self.send_buffer_capacity
            )));
        }

        self.broadcast.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Spawned(NetId),
    Unspawned(NetId),
}

#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub send: SendStats,
    pub broadcast: BroadcastStats,
    pub spawned: usize,
}

/// Local replica of the server's entities, indexed by netId.
pub struct ClientState {
    world: World,
    spawned: AHashMap<NetId, EntityKey>,
    prefabs: PrefabRegistry,
    events: Vec<ClientEvent>,
}

/// The client only ever talks to its server.
impl AuthContext for ClientState {
    fn is_authenticated(&self, _connection_id: ConnectionId) -> bool {
        true
    }
}

impl ClientState {
    fn new(prefabs: PrefabRegistry) -> Self {
        Self {
            world: World::new(),
            spawned: AHashMap::new(),
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

    pub fn entity_key(&self, net_id: NetId) -> Option<EntityKey> {
        self.spawned.get(&net_id).copied()
    }

    pub fn entity(&self, net_id: NetId) -> Option<&NetworkEntity> {
        self.entity_key(net_id).and_then(|key| self.world.get(key))
    }

    pub fn entity_mut(&mut self, net_id: NetId) -> Option<&mut NetworkEntity> {
        let key = self.entity_key(net_id)?;
        self.world.get_mut(key)
    }

    pub fn spawned_count(&self) -> usize {
        self.spawned.len()
    }

    pub fn push_event(&mut self, event: ClientEvent) {
        self.events.push(event);
    }

    /// Instantiates the prefab named by the server. Unknown prefabs and
    /// duplicate netIds are logged and ignored.
    pub fn spawn(&mut self, message: SpawnMessage) -> Result<EntityKey> {
        if self.spawned.contains_key(&message.net_id) {
            tracing::warn!("Spawn for netId {} which is already spawned", message.net_id);
            return Err(ReplicationError::AlreadySpawned(message.net_id));
        }

        let mut entity = match self.prefabs.instantiate(
            &message.prefab_id,
            message.position,
            decompress_quaternion(message.rotation),
        ) {
            Ok(entity) => entity,
            Err(e) => {
                tracing::warn!("Ignoring spawn of netId {}: {}", message.net_id, e);
                return Err(e);
            }
        };

        entity.net_id = message.net_id;
        entity.owned = message.owned;

        let key = self.world.insert(entity);
        self.spawned.insert(message.net_id, key);
        self.events.push(ClientEvent::Spawned(message.net_id));

        Ok(key)
    }

    pub fn unspawn(&mut self, net_id: NetId) -> Result<()> {
        let Some(key) = self.spawned.remove(&net_id) else {
            tracing::debug!("Unspawn for unknown netId {}", net_id);
            return Err(ReplicationError::UnknownNetId(net_id));
        };

        self.world.remove(key);
        self.events.push(ClientEvent::Unspawned(net_id));
        Ok(())
    }

    fn apply_transform(&mut self, message: TransformMessage) {
        let Some(entity) = self.entity_mut(message.net_id) else {
            tracing::debug!("Transform for unknown netId {}", message.net_id);
            return;
        };

        // This client is the authority for its own client-driven entities.
        if entity.owned && entity.is_client_authoritative() {
            return;
        }

        entity.position = message.position;
        entity.rotation = decompress_quaternion(message.rotation);
    }

    fn destroy_all(&mut self) {
        self.spawned.clear();
        self.world.clear();
    }
}

pub struct ClientSession<T: Transport, C: StateCollector = TransformCollector> {
    state: ClientState,
    router: MessageRouter<ClientState>,
    sender: MessageSender<T>,
    broadcast: ClientStateBroadcast<C>,
    config: ClientConfig,
    connect_state: ConnectState,
}

impl<T: Transport> ClientSession<T> {
    pub fn new(transport: T, prefabs: PrefabRegistry, config: ClientConfig) -> Result<Self> {
        Self::with_collector(transport, prefabs, config, TransformCollector)
    }
}

impl<T: Transport, C: StateCollector> ClientSession<T, C> {
    pub fn with_collector(transport: T, prefabs: PrefabRegistry, config: ClientConfig, collector: C) -> Result<Self> {
        config.validate()?;

        let mut router = MessageRouter::new();
        router.register::<SpawnMessage, _>(false, |state: &mut ClientState, _, message| {
            // Unknown prefabs and duplicates are logged by the state and never fatal.
            if let Err(e) = state.spawn(message) {
                tracing::trace!("Spawn {} ignored: {}", message.net_id, e);
            }
        });
        router.register::<UnspawnMessage, _>(false, |state: &mut ClientState, _, message| {
            if let Err(e) = state.unspawn(message.net_id) {
                tracing::trace!("Unspawn ignored: {}", e);
            }
        });
        router.register::<TransformMessage, _>(false, |state: &mut ClientState, _, message| {
            state.apply_transform(message);
        });

        Ok(Self {
            state: ClientState::new(prefabs),
            router,
            sender: MessageSender::new(transport, config.send_buffer_capacity),
            broadcast: ClientStateBroadcast::with_collector(&config.broadcast, collector),
            config,
            connect_state: ConnectState::Disconnected,
        })
    }

    /// Registers a handler for an application message sent by the server.
    pub fn register_handler<M, F>(&mut self, handler: F)
    where
        M: NetworkMessage,
        F: Fn(&mut ClientState, ConnectionId, M) + 'static,
    {
        self.router.register::<M, F>(false, handler);
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connect_state(&self) -> ConnectState {
        self.connect_state
    }

    pub fn is_connected(&self) -> bool {
        self.connect_state == ConnectState::Connected
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ClientState {
        &mut self.state
    }

    pub fn world(&self) -> &World {
        &self.state.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.state.world
    }

    pub fn entity(&self, net_id: NetId) -> Option<&NetworkEntity> {
        self.state.entity(net_id)
    }

    pub fn transport(&self) -> &T {
        self.sender.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.sender.transport_mut()
    }

    pub fn take_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.state.events)
    }

    /// Starts connecting. Entities left over from a frozen scene are
    /// destroyed first.
    pub fn connect(&mut self, address: &str) -> Result<()> {
        if self.connect_state != ConnectState::Disconnected {
            tracing::debug!("Connect to {} ignored, client is {:?}", address, self.connect_state);
            return Ok(());
        }

        self.state.destroy_all();
        self.connect_state = ConnectState::Connecting;
        tracing::info!("Connecting to {}", address);

        if let Err(e) = self.sender.transport_mut().connect(address) {
            tracing::error!("Connect to {} failed: {}", address, e);
            self.connect_state = ConnectState::Disconnected;
            return Err(e);
        }

        Ok(())
    }

    /// Closes the transport and returns once it is closed.
    pub fn disconnect(&mut self) {
        if self.connect_state == ConnectState::Disconnected {
            return;
        }

        self.sender.transport_mut().disconnect(None);
        self.teardown();
    }

    fn teardown(&mut self) {
        self.state.spawned.clear();
        self.connect_state = ConnectState::Disconnected;

        if !self.config.freeze_scene_on_disconnect {
            self.state.world.clear();
        }

        self.state.events.push(ClientEvent::Disconnected);
        tracing::info!("Disconnected from server");
    }

    /// Sends one message to the server.
    pub fn send<M: NetworkMessage>(&mut self, message: &M, channel: Channel) -> Result<()> {
        if self.connect_state != ConnectState::Connected {
            return Err(ReplicationError::Transport(format!(
                "cannot send {} while {:?}",
                M::NAME,
                self.connect_state
            )));
        }

        self.sender.send_message(None, message, channel)
    }

    /// One client tick: apply server traffic, then push owned
    /// client-authoritative state.
    pub fn update(&mut self, now: f64) {
        while let Some(event) = self.sender.transport_mut().poll_event() {
            match event {
                TransportEvent::Connected(_) => self.handle_connected(),
                TransportEvent::Data { payload, .. } => self.handle_data(&payload),
                TransportEvent::Disconnected(_) => {
                    if self.connect_state != ConnectState::Disconnected {
                        self.teardown();
                    }
                }
            }
        }

        if self.connect_state == ConnectState::Connected {
            self.broadcast.update(now, &self.state.world, &mut self.sender);
        }
    }

    fn handle_connected(&mut self) {
        if self.connect_state != ConnectState::Connecting {
            tracing::debug!("Unexpected connect event while {:?}", self.connect_state);
            return;
        }

        self.connect_state = ConnectState::Connected;
        self.state.events.push(ClientEvent::Connected);
        tracing::info!("Connected to server");
    }

    fn handle_data(&mut self, payload: &[u8]) {
        if self.connect_state != ConnectState::Connected {
            tracing::debug!("Dropping {} received while {:?}", debug::format_bytes(payload.len()), self.connect_state);
            return;
        }

        debug::trace_transport_receive(payload.len(), LOCAL_CONNECTION);

        if let Err(e) = self.process_frame(payload) {
            tracing::warn!("Disconnecting from server: {}", e);
            self.disconnect();
        }
    }

    /// Dispatches every body of one `messageId | count | body x count` frame.
    /// The declared count must account for exactly the bytes after the
    /// header, so nothing is applied from a frame that is later rejected.
    fn process_frame(&mut self, payload: &[u8]) -> Result<()> {
        let mut reader = NetworkReader::new(payload);
        let header: MessageHeader = reader
            .read_header()
            .ok_or_else(|| ReplicationError::MalformedFrame("frame shorter than a header".to_string()))?;

        let body_size = self.router
            .body_size(header.message_id)
            .ok_or(ReplicationError::UnknownMessage(header.message_id))?;

        let count = header.count as usize;
        if body_size == 0 && count > MAX_EMPTY_BODIES_PER_FRAME {
            return Err(ReplicationError::MalformedFrame(format!(
                "{} declares more than {} empty bodies",
                debug::message_summary(&header),
                MAX_EMPTY_BODIES_PER_FRAME
            )));
        }

        if count.checked_mul(body_size) != Some(reader.remaining()) {
            return Err(ReplicationError::MalformedFrame(format!(
                "{} of {} bytes each does not match {} body bytes",
                debug::message_summary(&header),
                body_size,
                reader.remaining()
            )));
        }

        for _ in 0..count {
            self.router
                .dispatch(&mut self.state, LOCAL_CONNECTION, header.message_id, &mut reader)?;
        }

        Ok(())
    }

    pub fn get_stats(&self) -> ClientStats {
        ClientStats {
            send: self.sender.get_stats().clone(),
            broadcast: self.broadcast.get_stats().clone(),
            spawned: self.state.spawned.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{angular_distance, compress_quaternion};
    use crate::prefab::Prefab;
    use crate::protocol::PrefabId;
    use crate::server::{ServerConfig, ServerSession};
    use crate::serialization::NetworkWriter;
    use crate::transport::MemoryTransport;
    use crate::world::SyncDirection;
    use glam::{Quat, Vec3};

    const PLAYER: PrefabId = PrefabId::from_u128(1);
    const CRATE: PrefabId = PrefabId::from_u128(2);

    fn prefabs() -> PrefabRegistry {
        let prefabs = PrefabRegistry::new();
        prefabs
            .register(Prefab::new(PLAYER, "player").with_transform(SyncDirection::ClientToServer))
            .unwrap();
        prefabs
            .register(Prefab::new(CRATE, "crate").with_transform(SyncDirection::ServerToClient))
            .unwrap();
        prefabs
    }

    fn client(config: ClientConfig) -> ClientSession<MemoryTransport> {
        let mut client = ClientSession::new(MemoryTransport::client(1200), prefabs(), config).unwrap();
        client.connect("127.0.0.1:7777").unwrap();
        client.update(0.0);
        client
    }

    fn frame<M: NetworkMessage>(messages: &[M]) -> Vec<u8> {
        let mut writer = NetworkWriter::with_capacity(1200);
        assert!(writer.write_header(MessageHeader::new(M::ID, messages.len() as u32)));
        for message in messages {
            assert!(writer.write(message));
        }
        writer.as_bytes().to_vec()
    }

    fn spawn_message(prefab_id: PrefabId, net_id: u64, owned: bool) -> SpawnMessage {
        SpawnMessage {
            prefab_id,
            net_id: NetId(net_id),
            owned,
            position: Vec3::new(1.0, 0.0, 0.0),
            rotation: compress_quaternion(Quat::IDENTITY),
        }
    }

    fn pipe_to_client(server: &mut ServerSession<MemoryTransport>, connection_id: ConnectionId, client: &mut ClientSession<MemoryTransport>) {
        for packet in server.transport_mut().take_sent() {
            if packet.connection_id == Some(connection_id) {
                client.transport_mut().queue_data(LOCAL_CONNECTION, packet.data);
            }
        }
    }

    fn pipe_to_server(client: &mut ClientSession<MemoryTransport>, server: &mut ServerSession<MemoryTransport>, connection_id: ConnectionId) {
        for packet in client.transport_mut().take_sent() {
            server.transport_mut().queue_data(connection_id, packet.data);
        }
    }

    #[test]
    fn test_connect_state_machine() {
        let mut client = ClientSession::new(MemoryTransport::client(1200), prefabs(), ClientConfig::default()).unwrap();
        assert_eq!(client.connect_state(), ConnectState::Disconnected);

        client.connect("127.0.0.1:7777").unwrap();
        assert_eq!(client.connect_state(), ConnectState::Connecting);

        // Connecting again is a no-op.
        client.connect("10.0.0.1:1").unwrap();
        assert_eq!(client.transport().connected_address(), Some("127.0.0.1:7777"));

        client.update(0.0);
        assert!(client.is_connected());

        client.disconnect();
        assert_eq!(client.connect_state(), ConnectState::Disconnected);
        assert!(!client.transport().is_active());
        assert_eq!(
            client.take_events(),
            vec![ClientEvent::Connected, ClientEvent::Disconnected]
        );

        client.disconnect();
        assert!(client.take_events().is_empty());
    }

    #[test]
    fn test_spawn_and_unspawn() {
        let mut client = client(ClientConfig::default());
        client.take_events();

        client.transport_mut().queue_data(
            LOCAL_CONNECTION,
            frame(&[spawn_message(PLAYER, 10, true), spawn_message(CRATE, 11, false)]),
        );
        client.update(0.01);

        let player = client.entity(NetId(10)).unwrap();
        assert!(player.owned);
        assert!(player.is_client_authoritative());
        assert_eq!(player.position, Vec3::new(1.0, 0.0, 0.0));
        assert!(!client.entity(NetId(11)).unwrap().owned);

        client.transport_mut().queue_data(LOCAL_CONNECTION, frame(&[UnspawnMessage { net_id: NetId(11) }]));
        client.update(0.02);

        assert!(client.entity(NetId(11)).is_none());
        assert_eq!(client.world().len(), 1);
        assert_eq!(
            client.take_events(),
            vec![
                ClientEvent::Spawned(NetId(10)),
                ClientEvent::Spawned(NetId(11)),
                ClientEvent::Unspawned(NetId(11)),
            ]
        );
    }

    #[test]
    fn test_benign_races_are_not_fatal() {
        let mut client = client(ClientConfig::default());

        client.transport_mut().queue_data(
            LOCAL_CONNECTION,
            frame(&[
                spawn_message(PrefabId::from_u128(999), 1, false),
                spawn_message(CRATE, 2, false),
                spawn_message(CRATE, 2, false),
            ]),
        );
        client.transport_mut().queue_data(LOCAL_CONNECTION, frame(&[UnspawnMessage { net_id: NetId(77) }]));
        client.update(0.01);

        assert!(client.is_connected());
        assert!(client.entity(NetId(1)).is_none());
        assert_eq!(client.world().len(), 1);
        assert!(matches!(client.state_mut().unspawn(NetId(77)), Err(ReplicationError::UnknownNetId(_))));
    }

    #[test]
    fn test_malformed_frame_disconnects() {
        let mut client = client(ClientConfig::default());

        let mut truncated = frame(&[UnspawnMessage { net_id: NetId(1) }, UnspawnMessage { net_id: NetId(2) }]);
        truncated.truncate(truncated.len() - 3);
        client.transport_mut().queue_data(LOCAL_CONNECTION, truncated);
        client.update(0.01);

        assert_eq!(client.connect_state(), ConnectState::Disconnected);
        assert!(!client.transport().is_active());
    }

    #[test]
    fn test_frame_count_must_match_body_bytes() {
        let mut client = client(ClientConfig::default());

        let mut short = frame(&[spawn_message(CRATE, 1, false), spawn_message(CRATE, 2, false)]);
        short[2..6].copy_from_slice(&3u32.to_le_bytes());
        client.transport_mut().queue_data(LOCAL_CONNECTION, short);
        client.update(0.01);

        assert!(!client.is_connected());
        assert_eq!(client.get_stats().spawned, 0);
        assert!(client.entity(NetId(1)).is_none());
    }

    #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
    struct Heartbeat;

    impl NetworkMessage for Heartbeat {
        const ID: u16 = crate::protocol::message_ids::APPLICATION_START + 2;
        const NAME: &'static str = "Heartbeat";
        const SIZE: usize = 0;

        fn encode<B: bytes::BufMut>(&self, _buf: &mut B) {}

        fn decode<B: bytes::Buf>(_buf: &mut B) -> Self {
            Heartbeat
        }
    }

    fn heartbeat_client(beats: &std::rc::Rc<std::cell::Cell<usize>>) -> ClientSession<MemoryTransport> {
        let mut client = client(ClientConfig::default());
        let counter = beats.clone();
        client.register_handler::<Heartbeat, _>(move |_, _, _| counter.set(counter.get() + 1));
        client
    }

    fn heartbeat_frame(count: u32) -> Vec<u8> {
        let mut writer = NetworkWriter::with_capacity(16);
        assert!(writer.write_header(MessageHeader::new(Heartbeat::ID, count)));
        writer.as_bytes().to_vec()
    }

    #[test]
    fn test_empty_body_runs_are_capped() {
        let beats = std::rc::Rc::new(std::cell::Cell::new(0));

        let mut client = heartbeat_client(&beats);
        client.transport_mut().queue_data(LOCAL_CONNECTION, heartbeat_frame(3));
        client.update(0.01);
        assert!(client.is_connected());
        assert_eq!(beats.get(), 3);

        client.transport_mut().queue_data(LOCAL_CONNECTION, heartbeat_frame(50_000_000));
        client.update(0.02);
        assert!(!client.is_connected());
        assert_eq!(beats.get(), 3);

        let mut client = heartbeat_client(&beats);
        let mut padded = heartbeat_frame(1);
        padded.push(0);
        client.transport_mut().queue_data(LOCAL_CONNECTION, padded);
        client.update(0.01);
        assert!(!client.is_connected());
        assert_eq!(beats.get(), 3);
    }

    #[test]
    fn test_unknown_message_disconnects() {
        let mut client = client(ClientConfig::default());

        let mut writer = NetworkWriter::with_capacity(16);
        writer.write_header(MessageHeader::new(0x0777, 1));
        writer.write_u32(0);
        client.transport_mut().queue_data(LOCAL_CONNECTION, writer.as_bytes().to_vec());
        client.update(0.02);
        assert!(!client.is_connected());
    }

    #[test]
    fn test_freeze_scene_on_disconnect() {
        let mut client = client(ClientConfig::new().with_freeze_scene_on_disconnect(true));
        client.transport_mut().queue_data(LOCAL_CONNECTION, frame(&[spawn_message(CRATE, 5, false)]));
        client.update(0.01);

        client.disconnect();
        assert_eq!(client.world().len(), 1);
        assert!(client.entity(NetId(5)).is_none());

        client.connect("127.0.0.1:7777").unwrap();
        assert!(client.world().is_empty());
    }

    #[test]
    fn test_disconnect_clears_scene_by_default() {
        let mut client = client(ClientConfig::default());
        client.transport_mut().queue_data(LOCAL_CONNECTION, frame(&[spawn_message(CRATE, 5, false)]));
        client.update(0.01);

        client.transport_mut().queue_disconnect(LOCAL_CONNECTION);
        client.update(0.02);

        assert_eq!(client.connect_state(), ConnectState::Disconnected);
        assert!(client.world().is_empty());
        assert_eq!(client.state().spawned_count(), 0);
    }

    #[test]
    fn test_owned_authoritative_entity_ignores_server_transform() {
        let mut client = client(ClientConfig::default());
        client.transport_mut().queue_data(
            LOCAL_CONNECTION,
            frame(&[spawn_message(PLAYER, 1, true), spawn_message(PLAYER, 2, false)]),
        );
        client.update(0.01);

        let moved = |net_id| TransformMessage {
            net_id: NetId(net_id),
            position: Vec3::new(9.0, 9.0, 9.0),
            rotation: compress_quaternion(Quat::IDENTITY),
        };
        client.transport_mut().queue_data(LOCAL_CONNECTION, frame(&[moved(1), moved(2)]));
        client.update(0.02);

        assert_eq!(client.entity(NetId(1)).unwrap().position, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(client.entity(NetId(2)).unwrap().position, Vec3::new(9.0, 9.0, 9.0));
    }

    #[test]
    fn test_send_requires_connection() {
        let mut client = ClientSession::new(MemoryTransport::client(1200), prefabs(), ClientConfig::default()).unwrap();
        let unspawn = UnspawnMessage { net_id: NetId(1) };
        assert!(client.send(&unspawn, Channel::Reliable).is_err());
    }

    #[test]
    fn test_end_to_end_replication() {
        let mut server = ServerSession::new(MemoryTransport::new(1200), prefabs(), ServerConfig::default()).unwrap();
        let mut client = client(ClientConfig::default());

        server.transport_mut().queue_connect(1);
        server.update(0.0);

        let player = server.spawn_prefab(&PLAYER, Vec3::ZERO, Quat::IDENTITY, Some(1)).unwrap();
        let near = server.spawn_prefab(&CRATE, Vec3::new(0.0, 0.0, 5.0), Quat::IDENTITY, None).unwrap();
        let far = server.spawn_prefab(&CRATE, Vec3::new(0.0, 0.0, 50.0), Quat::IDENTITY, None).unwrap();

        server.update(0.2);
        pipe_to_client(&mut server, 1, &mut client);
        client.update(0.2);

        assert_eq!(client.world().len(), 2);
        assert!(client.entity(player.to_net_id()).unwrap().owned);
        assert!(!client.entity(near.to_net_id()).unwrap().owned);
        assert!(client.entity(far.to_net_id()).is_none());

        // Server-driven state reaches the client.
        let rotation = Quat::from_rotation_y(1.2);
        {
            let crate_entity = server.world_mut().get_mut(near).unwrap();
            crate_entity.position = Vec3::new(2.0, 0.0, 5.0);
            crate_entity.rotation = rotation;
        }
        server.update(0.26);
        pipe_to_client(&mut server, 1, &mut client);
        client.update(0.26);

        let replica = client.entity(near.to_net_id()).unwrap();
        assert_eq!(replica.position, Vec3::new(2.0, 0.0, 5.0));
        assert!(angular_distance(replica.rotation, rotation) < 0.01);

        // Client-driven state reaches the server.
        let key = client.state().entity_key(player.to_net_id()).unwrap();
        client.world_mut().get_mut(key).unwrap().position = Vec3::new(0.0, 1.0, 0.0);
        client.update(0.4);
        pipe_to_server(&mut client, &mut server, 1);
        server.update(0.41);
        assert_eq!(server.world().get(player).unwrap().position, Vec3::new(0.0, 1.0, 0.0));

        // Destroying on the server removes the replica.
        server.destroy(near).unwrap();
        pipe_to_client(&mut server, 1, &mut client);
        client.update(0.5);
        assert!(client.entity(near.to_net_id()).is_none());
        assert_eq!(client.world().len(), 1);
    }

    #[test]
    fn test_config_from_json() {
        let config = ClientConfig::from_json_str(r#"{"freeze_scene_on_disconnect": true}"#).unwrap();
        assert!(config.freeze_scene_on_disconnect);
        assert_eq!(config.send_buffer_capacity, 1200);
        assert!(ClientConfig::new().with_send_buffer_capacity(2).validate().is_err());
    }
}
