use crate::error::{ReplicationError, Result};
use crate::protocol::PrefabId;
use crate::world::{NetworkEntity, NetworkTransform, SyncDirection};
use ahash::AHashMap;
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prefab {
    pub prefab_id: PrefabId,
    pub name: String,
    pub transform: Option<NetworkTransform>,
    pub description: Option<String>,
}

impl Prefab {
    pub fn new(prefab_id: PrefabId, name: impl Into<String>) -> Self {
        Self {
            prefab_id,
            name: name.into(),
            transform: None,
            description: None,
        }
    }

    pub fn with_transform(mut self, direction: SyncDirection) -> Self {
        self.transform = Some(NetworkTransform { direction });
        self
    }

    pub fn with_description(mut self, description: String) -> Self {
        self.description = Some(description);
        self
    }

    pub fn instantiate(&self, position: Vec3, rotation: Quat) -> NetworkEntity {
        let mut entity = NetworkEntity::new(self.prefab_id, position, rotation);
        entity.transform = self.transform;
        entity
    }
}

/// Template provider shared by the server and client sessions of one process.
pub struct PrefabRegistry {
    prefabs: Arc<RwLock<AHashMap<PrefabId, Prefab>>>,
}

impl PrefabRegistry {
    pub fn new() -> Self {
        Self {
            prefabs: Arc::new(RwLock::new(AHashMap::new())),
        }
    }

    pub fn register(&self, prefab: Prefab) -> Result<()> {
        let mut prefabs = self.prefabs.write()
            .map_err(|e| ReplicationError::LockPoisoned(e.to_string()))?;

        if prefabs.contains_key(&prefab.prefab_id) {
            return Err(ReplicationError::DuplicatePrefab(prefab.prefab_id));
        }

        prefabs.insert(prefab.prefab_id, prefab);

        Ok(())
    }

    pub fn get(&self, prefab_id: &PrefabId) -> Option<Prefab> {
        self.prefabs.read()
            .ok()?
            .get(prefab_id)
            .cloned()
    }

    pub fn has(&self, prefab_id: &PrefabId) -> bool {
        self.prefabs.read()
            .map(|prefabs| prefabs.contains_key(prefab_id))
            .unwrap_or(false)
    }

    pub fn get_all(&self) -> Result<Vec<Prefab>> {
        let prefabs = self.prefabs.read()
            .map_err(|e| ReplicationError::LockPoisoned(e.to_string()))?;

        Ok(prefabs.values().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.prefabs.read()
            .map(|prefabs| prefabs.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds an entity from the registered template, if there is one.
    pub fn instantiate(&self, prefab_id: &PrefabId, position: Vec3, rotation: Quat) -> Result<NetworkEntity> {
        self.get(prefab_id)
            .map(|prefab| prefab.instantiate(position, rotation))
            .ok_or(ReplicationError::UnknownPrefab(*prefab_id))
    }
}

impl Default for PrefabRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for PrefabRegistry {
    fn clone(&self) -> Self {
        Self {
            prefabs: Arc::clone(&self.prefabs),
        }
    }
}
