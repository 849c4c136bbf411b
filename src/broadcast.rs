//! Periodic state broadcast of synchronizable components.

use crate::batch::MessageSender;
use crate::compression::compress_quaternion;
use crate::connection::ConnectionRegistry;
use crate::error::{ReplicationError, Result};
use crate::interval::IntervalTimer;
use crate::protocol::{ConnectionId, NetworkMessage, TransformMessage};
use crate::transport::{Channel, Transport};
use crate::world::{NetworkEntity, SyncDirection, World};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Seconds between broadcasts.
    pub send_interval: f64,
    pub channel: Channel,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            send_interval: 0.05,
            channel: Channel::Unreliable,
        }
    }
}

impl BroadcastConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_send_interval(mut self, seconds: f64) -> Self {
        self.send_interval = seconds;
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.send_interval.is_finite() && self.send_interval > 0.0) {
            return Err(ReplicationError::InvalidConfig(format!(
                "broadcast send_interval must be positive, got {}",
                self.send_interval
            )));
        }
        Ok(())
    }
}

/// Builds the state message of one entity, or `None` when the entity has no
/// synchronizable component.
pub trait StateCollector {
    type Message: NetworkMessage;

    fn collect(&self, entity: &NetworkEntity) -> Option<(Self::Message, SyncDirection)>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransformCollector;

impl StateCollector for TransformCollector {
    type Message = TransformMessage;

    fn collect(&self, entity: &NetworkEntity) -> Option<(TransformMessage, SyncDirection)> {
        let transform = entity.transform?;

        let message = TransformMessage {
            net_id: entity.net_id,
            position: entity.position,
            rotation: compress_quaternion(entity.rotation),
        };

        Some((message, transform.direction))
    }
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub cycles: u64,
    pub messages_queued: u64,
    pub last_messages_queued: usize,
}

/// Server side: sends each observed entity's state to its observers. The
/// owner of a client-authoritative entity is skipped since it already holds
/// the authoritative value.
pub struct StateBroadcast<C: StateCollector = TransformCollector> {
    collector: C,
    timer: IntervalTimer,
    channel: Channel,
    queues: AHashMap<ConnectionId, Vec<C::Message>>,
    stats: BroadcastStats,
}

impl StateBroadcast<TransformCollector> {
    pub fn new(config: &BroadcastConfig) -> Self {
        Self::with_collector(config, TransformCollector)
    }
}

impl<C: StateCollector> StateBroadcast<C> {
    pub fn with_collector(config: &BroadcastConfig, collector: C) -> Self {
        Self {
            collector,
            timer: IntervalTimer::new(config.send_interval),
            channel: config.channel,
            queues: AHashMap::new(),
            stats: BroadcastStats::default(),
        }
    }

    pub fn get_stats(&self) -> &BroadcastStats {
        &self.stats
    }

    pub fn update<T: Transport>(
        &mut self,
        now: f64,
        world: &World,
        registry: &mut ConnectionRegistry,
        sender: &mut MessageSender<T>,
    ) -> bool {
        if !self.timer.check(now) {
            return false;
        }

        self.broadcast_now(world, registry, sender);
        true
    }

    pub fn broadcast_now<T: Transport>(
        &mut self,
        world: &World,
        registry: &mut ConnectionRegistry,
        sender: &mut MessageSender<T>,
    ) {
        for queue in self.queues.values_mut() {
            queue.clear();
        }

        let mut queued = 0;

        for (_, entity) in world.iter() {
            if !entity.is_spawned() || entity.observers.is_empty() {
                continue;
            }

            let Some((message, direction)) = self.collector.collect(entity) else {
                continue;
            };

            for &observer in &entity.observers {
                if direction == SyncDirection::ClientToServer && entity.connection_id == Some(observer) {
                    continue;
                }

                self.queues.entry(observer).or_default().push(message);
                queued += 1;
            }
        }

        for (&connection_id, messages) in self.queues.iter() {
            let Some(connection) = registry.get_mut(connection_id) else {
                continue;
            };

            match sender.send_batch(connection, messages, self.channel) {
                Ok(_) | Err(ReplicationError::ConnectionBroken(_)) => {}
                Err(e) => {
                    tracing::debug!("State broadcast to connection {} stopped: {}", connection_id, e);
                }
            }
        }

        self.queues.retain(|connection_id, _| registry.contains(*connection_id));

        self.stats.cycles += 1;
        self.stats.messages_queued += queued as u64;
        self.stats.last_messages_queued = queued;
    }
}

/// Client side: pushes the local state of entities this client owns and is
/// authoritative for, every interval, unconditionally.
pub struct ClientStateBroadcast<C: StateCollector = TransformCollector> {
    collector: C,
    timer: IntervalTimer,
    channel: Channel,
    stats: BroadcastStats,
}

impl ClientStateBroadcast<TransformCollector> {
    pub fn new(config: &BroadcastConfig) -> Self {
        Self::with_collector(config, TransformCollector)
    }
}

impl<C: StateCollector> ClientStateBroadcast<C> {
    pub fn with_collector(config: &BroadcastConfig, collector: C) -> Self {
        Self {
            collector,
            timer: IntervalTimer::new(config.send_interval),
            channel: config.channel,
            stats: BroadcastStats::default(),
        }
    }

    pub fn get_stats(&self) -> &BroadcastStats {
        &self.stats
    }

    /// Returns the number of messages sent, zero when not due.
    pub fn update<T: Transport>(&mut self, now: f64, world: &World, sender: &mut MessageSender<T>) -> usize {
        if !self.timer.check(now) {
            return 0;
        }

        let mut sent = 0;

        for (_, entity) in world.iter() {
            if !entity.owned || !entity.is_spawned() {
                continue;
            }

            let Some((message, SyncDirection::ClientToServer)) = self.collector.collect(entity) else {
                continue;
            };

            match sender.send_message(None, &message, self.channel) {
                Ok(()) => sent += 1,
                Err(e) => tracing::debug!("Client state send for {} failed: {}", entity.net_id, e),
            }
        }

        self.stats.cycles += 1;
        self.stats.messages_queued += sent as u64;
        self.stats.last_messages_queued = sent;

        sent
    }
}
