use bytes::{Buf, BufMut};
use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type ConnectionId = u32;
pub type MessageId = u16;

/// Stable ids of the messages the replication core exchanges. Application
/// messages must use ids at or above [`message_ids::APPLICATION_START`].
pub mod message_ids {
    use super::MessageId;

    pub const CONNECT: MessageId = 0x0001;
    pub const DISCONNECT: MessageId = 0x0002;
    pub const SPAWN: MessageId = 0x0022;
    pub const UNSPAWN: MessageId = 0x0023;
    pub const TRANSFORM: MessageId = 0x0025;

    pub const APPLICATION_START: MessageId = 0x1000;

    pub fn is_core(id: MessageId) -> bool {
        id < APPLICATION_START
    }

    /// Lifecycle ids raised by the session itself, never accepted off the wire.
    pub fn is_local_only(id: MessageId) -> bool {
        id == CONNECT || id == DISCONNECT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct NetId(pub u64);

impl NetId {
    /// Sentinel for "not currently spawned".
    pub const NONE: NetId = NetId(0);

    pub fn is_spawned(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 128-bit template identifier shared by server and client content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PrefabId(pub [u8; 16]);

impl PrefabId {
    pub const fn from_u128(value: u128) -> Self {
        Self(value.to_le_bytes())
    }

    pub fn as_u128(&self) -> u128 {
        u128::from_le_bytes(self.0)
    }
}

impl fmt::Display for PrefabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.as_u128())
    }
}

/// A fixed-layout message. `SIZE` is the exact number of body bytes written
/// by `encode` and consumed by `decode`; callers check bounds before either
/// is invoked, so neither may fail.
pub trait NetworkMessage: Copy + fmt::Debug + Serialize + 'static {
    const ID: MessageId;
    const NAME: &'static str;
    const SIZE: usize;

    fn encode<B: BufMut>(&self, buf: &mut B);
    fn decode<B: Buf>(buf: &mut B) -> Self;
}

/// Server to client frame header: `messageId:u16 | count:u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub message_id: MessageId,
    pub count: u32,
}

impl MessageHeader {
    pub const SIZE: usize = 6;

    pub fn new(message_id: MessageId, count: u32) -> Self {
        Self { message_id, count }
    }
}

fn put_vec3<B: BufMut>(buf: &mut B, v: Vec3) {
    buf.put_f32_le(v.x);
    buf.put_f32_le(v.y);
    buf.put_f32_le(v.z);
}

fn get_vec3<B: Buf>(buf: &mut B) -> Vec3 {
    let x = buf.get_f32_le();
    let y = buf.get_f32_le();
    let z = buf.get_f32_le();
    Vec3::new(x, y, z)
}

/// Artificial event dispatched when a transport connection is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ConnectMessage;

impl NetworkMessage for ConnectMessage {
    const ID: MessageId = message_ids::CONNECT;
    const NAME: &'static str = "Connect";
    const SIZE: usize = 0;

    fn encode<B: BufMut>(&self, _buf: &mut B) {}

    fn decode<B: Buf>(_buf: &mut B) -> Self {
        ConnectMessage
    }
}

/// Artificial event dispatched before a disconnected connection is cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DisconnectMessage;

impl NetworkMessage for DisconnectMessage {
    const ID: MessageId = message_ids::DISCONNECT;
    const NAME: &'static str = "Disconnect";
    const SIZE: usize = 0;

    fn encode<B: BufMut>(&self, _buf: &mut B) {}

    fn decode<B: Buf>(_buf: &mut B) -> Self {
        DisconnectMessage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpawnMessage {
    pub prefab_id: PrefabId,
    pub net_id: NetId,
    pub owned: bool,
    pub position: Vec3,
    pub rotation: u32,
}

impl NetworkMessage for SpawnMessage {
    const ID: MessageId = message_ids::SPAWN;
    const NAME: &'static str = "Spawn";
    const SIZE: usize = 16 + 8 + 1 + 12 + 4;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.prefab_id.0);
        buf.put_u64_le(self.net_id.0);
        buf.put_u8(self.owned as u8);
        put_vec3(buf, self.position);
        buf.put_u32_le(self.rotation);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        let mut prefab = [0u8; 16];
        buf.copy_to_slice(&mut prefab);
        let net_id = NetId(buf.get_u64_le());
        let owned = buf.get_u8() != 0;
        let position = get_vec3(buf);
        let rotation = buf.get_u32_le();

        Self {
            prefab_id: PrefabId(prefab),
            net_id,
            owned,
            position,
            rotation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspawnMessage {
    pub net_id: NetId,
}

impl NetworkMessage for UnspawnMessage {
    const ID: MessageId = message_ids::UNSPAWN;
    const NAME: &'static str = "Unspawn";
    const SIZE: usize = 8;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.net_id.0);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        Self {
            net_id: NetId(buf.get_u64_le()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformMessage {
    pub net_id: NetId,
    pub position: Vec3,
    pub rotation: u32,
}

impl NetworkMessage for TransformMessage {
    const ID: MessageId = message_ids::TRANSFORM;
    const NAME: &'static str = "Transform";
    const SIZE: usize = 8 + 12 + 4;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.net_id.0);
        put_vec3(buf, self.position);
        buf.put_u32_le(self.rotation);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        let net_id = NetId(buf.get_u64_le());
        let position = get_vec3(buf);
        let rotation = buf.get_u32_le();

        Self {
            net_id,
            position,
            rotation,
        }
    }
}

pub fn message_name(id: MessageId) -> &'static str {
    match id {
        message_ids::CONNECT => ConnectMessage::NAME,
        message_ids::DISCONNECT => DisconnectMessage::NAME,
        message_ids::SPAWN => SpawnMessage::NAME,
        message_ids::UNSPAWN => UnspawnMessage::NAME,
        message_ids::TRANSFORM => TransformMessage::NAME,
        id if !message_ids::is_core(id) => "Application",
        _ => "Unknown",
    }
}
