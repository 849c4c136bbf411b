//! Observer-set rebuilds and spawn/unspawn diffing.
//!
//! Every rebuild is a full pass: snapshot the positions of every connection's
//! owned entities, recompute each spawned entity's observers with the
//! configured [`ObserverStrategy`], diff against the previous observer set and
//! flush the resulting unspawns and spawns per connection.

use crate::batch::MessageSender;
use crate::compression::compress_quaternion;
use crate::connection::ConnectionRegistry;
use crate::debug;
use crate::error::{ReplicationError, Result};
use crate::interval::IntervalTimer;
use crate::protocol::{ConnectionId, SpawnMessage, UnspawnMessage};
use crate::transport::{Channel, Transport};
use crate::world::{NetworkEntity, World};
use ahash::AHashMap;
use glam::Vec3;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterestConfig {
    /// Seconds between scheduled rebuilds.
    pub update_interval: f64,
    pub visibility_radius: f32,
}

impl Default for InterestConfig {
    fn default() -> Self {
        Self {
            update_interval: 0.1,
            visibility_radius: 15.0,
        }
    }
}

impl InterestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_update_interval(mut self, seconds: f64) -> Self {
        self.update_interval = seconds;
        self
    }

    pub fn with_visibility_radius(mut self, radius: f32) -> Self {
        self.visibility_radius = radius;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.update_interval.is_finite() && self.update_interval > 0.0) {
            return Err(ReplicationError::InvalidConfig(format!(
                "interest update_interval must be positive, got {}",
                self.update_interval
            )));
        }

        if !(self.visibility_radius.is_finite() && self.visibility_radius > 0.0) {
            return Err(ReplicationError::InvalidConfig(format!(
                "visibility_radius must be positive, got {}",
                self.visibility_radius
            )));
        }

        Ok(())
    }
}

/// Positions of every connection's owned entities, sorted by connection id so
/// that all eyes of one connection form a contiguous range.
#[derive(Debug, Default)]
pub struct EyeIndex {
    entries: Vec<(ConnectionId, Vec3)>,
    connections: Vec<ConnectionId>,
}

impl EyeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.connections.clear();
    }

    pub fn push(&mut self, connection_id: ConnectionId, position: Vec3) {
        self.entries.push((connection_id, position));
    }

    /// Sorts the pushed entries. Must be called before lookups.
    pub fn finish(&mut self) {
        self.entries.sort_by_key(|(connection_id, _)| *connection_id);

        self.connections.clear();
        for (connection_id, _) in &self.entries {
            if self.connections.last() != Some(connection_id) {
                self.connections.push(*connection_id);
            }
        }
    }

    /// Connections that own at least one spawned entity.
    pub fn connections(&self) -> &[ConnectionId] {
        &self.connections
    }

    pub fn positions_of(&self, connection_id: ConnectionId) -> impl Iterator<Item = Vec3> + '_ {
        let start = self.entries.partition_point(|(id, _)| *id < connection_id);
        let end = self.entries.partition_point(|(id, _)| *id <= connection_id);
        self.entries[start..end].iter().map(|(_, position)| *position)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Computes the rebuild set of one entity. Implementations only write to
/// `result`, which arrives empty.
pub trait ObserverStrategy {
    fn rebuild_observers(&self, entity: &NetworkEntity, eyes: &EyeIndex, result: &mut Vec<ConnectionId>);
}

/// Brute-force visibility: a connection observes an entity when any of its
/// owned entities lies within `visibility_radius`.
#[derive(Debug, Clone, Copy)]
pub struct DistanceInterest {
    pub visibility_radius: f32,
}

impl DistanceInterest {
    pub fn new(visibility_radius: f32) -> Self {
        Self { visibility_radius }
    }
}

impl ObserverStrategy for DistanceInterest {
    fn rebuild_observers(&self, entity: &NetworkEntity, eyes: &EyeIndex, result: &mut Vec<ConnectionId>) {
        let radius_squared = self.visibility_radius * self.visibility_radius;

        for &connection_id in eyes.connections() {
            let visible = eyes
                .positions_of(connection_id)
                .any(|eye| eye.distance_squared(entity.position) <= radius_squared);

            if visible {
                result.push(connection_id);
            }
        }
    }
}

/// Messages queued for one connection during a rebuild.
#[derive(Debug, Default)]
pub struct OutgoingQueue {
    pub unspawns: Vec<UnspawnMessage>,
    pub spawns: Vec<SpawnMessage>,
}

impl OutgoingQueue {
    pub fn clear(&mut self) {
        self.unspawns.clear();
        self.spawns.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.unspawns.is_empty() && self.spawns.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct InterestStats {
    pub rebuild_count: u64,
    pub total_spawns: u64,
    pub total_unspawns: u64,
    pub last_entity_count: usize,
    pub last_connection_count: usize,
    pub last_spawns: usize,
    pub last_unspawns: usize,
}

pub struct InterestManagement<S: ObserverStrategy = DistanceInterest> {
    strategy: S,
    timer: IntervalTimer,
    eyes: EyeIndex,
    rebuild_set: Vec<ConnectionId>,
    queues: AHashMap<ConnectionId, OutgoingQueue>,
    stats: InterestStats,
}

impl InterestManagement<DistanceInterest> {
    pub fn new(config: &InterestConfig) -> Self {
        Self::with_strategy(config.update_interval, DistanceInterest::new(config.visibility_radius))
    }
}

impl<S: ObserverStrategy> InterestManagement<S> {
    pub fn with_strategy(update_interval: f64, strategy: S) -> Self {
        Self {
            strategy,
            timer: IntervalTimer::new(update_interval),
            eyes: EyeIndex::new(),
            rebuild_set: Vec::new(),
            queues: AHashMap::new(),
            stats: InterestStats::default(),
        }
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn timer(&self) -> &IntervalTimer {
        &self.timer
    }

    pub fn get_stats(&self) -> &InterestStats {
        &self.stats
    }

    /// Runs a rebuild if the update interval has elapsed. Returns whether one ran.
    pub fn update<T: Transport>(
        &mut self,
        now: f64,
        world: &mut World,
        registry: &mut ConnectionRegistry,
        sender: &mut MessageSender<T>,
    ) -> bool {
        if !self.timer.is_due(now) {
            return false;
        }

        self.rebuild_now(now, world, registry, sender);
        true
    }

    /// Runs a full rebuild regardless of the interval timer.
    pub fn rebuild_now<T: Transport>(
        &mut self,
        now: f64,
        world: &mut World,
        registry: &mut ConnectionRegistry,
        sender: &mut MessageSender<T>,
    ) {
        self.timer.mark(now);

        self.snapshot_eyes(world, registry);

        for queue in self.queues.values_mut() {
            queue.clear();
        }

        let (spawns, unspawns, entities) = self.diff_observers(world, registry);

        self.flush(registry, sender);
        self.queues.retain(|connection_id, _| registry.contains(*connection_id));

        self.stats.rebuild_count += 1;
        self.stats.total_spawns += spawns as u64;
        self.stats.total_unspawns += unspawns as u64;
        self.stats.last_entity_count = entities;
        self.stats.last_connection_count = registry.len();
        self.stats.last_spawns = spawns;
        self.stats.last_unspawns = unspawns;

        debug::trace_rebuild(&self.stats);
    }

    fn snapshot_eyes(&mut self, world: &World, registry: &ConnectionRegistry) {
        self.eyes.clear();

        for connection in registry.iter() {
            for &key in &connection.owned_entities {
                if let Some(entity) = world.get(key).filter(|entity| entity.is_spawned()) {
                    self.eyes.push(connection.connection_id, entity.position);
                }
            }
        }

        self.eyes.finish();
    }

    fn diff_observers(&mut self, world: &mut World, registry: &ConnectionRegistry) -> (usize, usize, usize) {
        let mut spawns = 0;
        let mut unspawns = 0;
        let mut entities = 0;

        for (_, entity) in world.iter_mut() {
            if !entity.is_spawned() {
                continue;
            }
            entities += 1;

            self.rebuild_set.clear();
            self.strategy.rebuild_observers(entity, &self.eyes, &mut self.rebuild_set);

            for &observer in &entity.observers {
                // Removed connections are already gone; nothing to tell them.
                if !self.rebuild_set.contains(&observer) && registry.contains(observer) {
                    self.queues
                        .entry(observer)
                        .or_default()
                        .unspawns
                        .push(UnspawnMessage { net_id: entity.net_id });
                    unspawns += 1;
                }
            }

            for &connection_id in &self.rebuild_set {
                if !entity.observers.contains(&connection_id) {
                    self.queues.entry(connection_id).or_default().spawns.push(SpawnMessage {
                        prefab_id: entity.prefab_id,
                        net_id: entity.net_id,
                        owned: entity.connection_id == Some(connection_id),
                        position: entity.position,
                        rotation: compress_quaternion(entity.rotation),
                    });
                    spawns += 1;
                }
            }

            entity.observers.clear();
            entity.observers.extend_from_slice(&self.rebuild_set);
        }

        (spawns, unspawns, entities)
    }

    fn flush<T: Transport>(&mut self, registry: &mut ConnectionRegistry, sender: &mut MessageSender<T>) {
        for (&connection_id, queue) in self.queues.iter() {
            if queue.is_empty() {
                continue;
            }

            let Some(connection) = registry.get_mut(connection_id) else {
                continue;
            };

            // Unspawns first keeps the receiver's live entity count low.
            let result = sender
                .send_batch(connection, &queue.unspawns, Channel::Reliable)
                .and_then(|_| sender.send_batch(connection, &queue.spawns, Channel::Reliable));

            match result {
                Ok(_) | Err(ReplicationError::ConnectionBroken(_)) => {}
                Err(e) => {
                    tracing::debug!("Interest flush to connection {} stopped: {}", connection_id, e);
                }
            }
        }
    }
}
