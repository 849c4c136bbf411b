//! Minimal slot+generation entity store holding replicated entity records.

use crate::protocol::{ConnectionId, NetId, PrefabId};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey {
    index: u32,
    generation: u32,
}

impl EntityKey {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Generations start at 1, so a derived netId is never the unspawned sentinel.
    pub fn to_net_id(self) -> NetId {
        NetId(((self.generation as u64) << 32) | self.index as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncDirection {
    ServerToClient,
    ClientToServer,
}

/// Marks an entity whose position and rotation are replicated by the state broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTransform {
    pub direction: SyncDirection,
}

impl NetworkTransform {
    pub fn server_to_client() -> Self {
        Self {
            direction: SyncDirection::ServerToClient,
        }
    }

    pub fn client_to_server() -> Self {
        Self {
            direction: SyncDirection::ClientToServer,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetworkEntity {
    pub prefab_id: PrefabId,
    pub net_id: NetId,
    pub connection_id: Option<ConnectionId>,
    /// Client side only: this client's connection owns the entity.
    pub owned: bool,
    pub position: Vec3,
    pub rotation: Quat,
    pub transform: Option<NetworkTransform>,
    /// Connections currently entitled to updates for this entity.
    pub observers: Vec<ConnectionId>,
}

impl NetworkEntity {
    pub fn new(prefab_id: PrefabId, position: Vec3, rotation: Quat) -> Self {
        Self {
            prefab_id,
            net_id: NetId::NONE,
            connection_id: None,
            owned: false,
            position,
            rotation,
            transform: None,
            observers: Vec::new(),
        }
    }

    pub fn with_transform(mut self, transform: NetworkTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn is_spawned(&self) -> bool {
        self.net_id.is_spawned()
    }

    pub fn is_observed_by(&self, connection_id: ConnectionId) -> bool {
        self.observers.contains(&connection_id)
    }

    pub fn is_client_authoritative(&self) -> bool {
        matches!(
            self.transform,
            Some(NetworkTransform {
                direction: SyncDirection::ClientToServer
            })
        )
    }
}

struct Slot {
    generation: u32,
    entity: Option<NetworkEntity>,
}

#[derive(Default)]
pub struct World {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: NetworkEntity) -> EntityKey {
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entity = Some(entity);
            return EntityKey {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            entity: Some(entity),
        });

        EntityKey {
            index,
            generation: 1,
        }
    }

    pub fn remove(&mut self, key: EntityKey) -> Option<NetworkEntity> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }

        let entity = slot.entity.take()?;
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        self.free.push(key.index);
        self.len -= 1;

        Some(entity)
    }

    pub fn get(&self, key: EntityKey) -> Option<&NetworkEntity> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.entity.as_ref())
    }

    pub fn get_mut(&mut self, key: EntityKey) -> Option<&mut NetworkEntity> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.entity.as_mut())
    }

    pub fn contains(&self, key: EntityKey) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityKey, &NetworkEntity)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entity.as_ref().map(|entity| {
                (
                    EntityKey {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entity,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityKey, &mut NetworkEntity)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.entity.as_mut().map(|entity| {
                (
                    EntityKey {
                        index: index as u32,
                        generation,
                    },
                    entity,
                )
            })
        })
    }

    pub fn keys(&self) -> Vec<EntityKey> {
        self.iter().map(|(key, _)| key).collect()
    }

    pub fn clear(&mut self) {
        for key in self.keys() {
            self.remove(key);
        }
    }
}
