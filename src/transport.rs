use crate::error::Result;
use crate::protocol::ConnectionId;
use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Connection id client-side transports report for their single server link.
pub const LOCAL_CONNECTION: ConnectionId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Channel {
    #[default]
    Reliable,
    Unreliable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(ConnectionId),
    Data {
        connection_id: ConnectionId,
        payload: Bytes,
        channel: Channel,
    },
    Disconnected(ConnectionId),
}

/// Socket layer consumed by the sessions. Sends report success synchronously;
/// inbound events are drained once per tick through `poll_event`.
pub trait Transport {
    fn connect(&mut self, address: &str) -> Result<()>;
    fn disconnect(&mut self, connection_id: Option<ConnectionId>);
    fn send(&mut self, connection_id: Option<ConnectionId>, data: &[u8], channel: Channel) -> bool;
    fn is_active(&self) -> bool;
    fn max_packet_size(&self) -> usize;
    fn poll_event(&mut self) -> Option<TransportEvent>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    pub connection_id: Option<ConnectionId>,
    pub data: Bytes,
    pub channel: Channel,
}

/// In-process transport. Records every send attempt, can be told to fail
/// sends to a connection, and turns `disconnect` into a queued
/// `Disconnected` event the way a socket layer would.
pub struct MemoryTransport {
    active: bool,
    max_packet_size: usize,
    inbound: VecDeque<TransportEvent>,
    sent: Vec<SentPacket>,
    send_attempts: AHashMap<Option<ConnectionId>, usize>,
    failing: AHashSet<Option<ConnectionId>>,
    disconnect_requests: Vec<Option<ConnectionId>>,
    connected_address: Option<String>,
}

impl MemoryTransport {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            active: true,
            max_packet_size,
            inbound: VecDeque::new(),
            sent: Vec::new(),
            send_attempts: AHashMap::new(),
            failing: AHashSet::new(),
            disconnect_requests: Vec::new(),
            connected_address: None,
        }
    }

    /// A client-side transport that is idle until `connect` is called.
    pub fn client(max_packet_size: usize) -> Self {
        let mut transport = Self::new(max_packet_size);
        transport.active = false;
        transport
    }

    pub fn push_event(&mut self, event: TransportEvent) {
        self.inbound.push_back(event);
    }

    pub fn queue_connect(&mut self, connection_id: ConnectionId) {
        self.push_event(TransportEvent::Connected(connection_id));
    }

    pub fn queue_data(&mut self, connection_id: ConnectionId, payload: impl Into<Bytes>) {
        self.push_event(TransportEvent::Data {
            connection_id,
            payload: payload.into(),
            channel: Channel::Reliable,
        });
    }

    pub fn queue_disconnect(&mut self, connection_id: ConnectionId) {
        let event = TransportEvent::Disconnected(connection_id);
        if !self.inbound.contains(&event) {
            self.push_event(event);
        }
    }

    pub fn fail_sends_to(&mut self, connection_id: Option<ConnectionId>) {
        self.failing.insert(connection_id);
    }

    pub fn restore_sends_to(&mut self, connection_id: Option<ConnectionId>) {
        self.failing.remove(&connection_id);
    }

    pub fn send_attempts(&self, connection_id: Option<ConnectionId>) -> usize {
        self.send_attempts.get(&connection_id).copied().unwrap_or(0)
    }

    pub fn sent(&self) -> &[SentPacket] {
        &self.sent
    }

    pub fn sent_to(&self, connection_id: Option<ConnectionId>) -> impl Iterator<Item = &SentPacket> {
        self.sent.iter().filter(move |packet| packet.connection_id == connection_id)
    }

    pub fn take_sent(&mut self) -> Vec<SentPacket> {
        std::mem::take(&mut self.sent)
    }

    pub fn disconnect_requests(&self) -> &[Option<ConnectionId>] {
        &self.disconnect_requests
    }

    pub fn connected_address(&self) -> Option<&str> {
        self.connected_address.as_deref()
    }

    pub fn pending_events(&self) -> usize {
        self.inbound.len()
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self, address: &str) -> Result<()> {
        self.active = true;
        self.connected_address = Some(address.to_string());
        self.push_event(TransportEvent::Connected(LOCAL_CONNECTION));
        Ok(())
    }

    fn disconnect(&mut self, connection_id: Option<ConnectionId>) {
        self.disconnect_requests.push(connection_id);

        match connection_id {
            Some(id) => self.queue_disconnect(id),
            None => {
                self.active = false;
                self.connected_address = None;
                self.inbound.clear();
            }
        }
    }

    fn send(&mut self, connection_id: Option<ConnectionId>, data: &[u8], channel: Channel) -> bool {
        *self.send_attempts.entry(connection_id).or_insert(0) += 1;

        if !self.active || self.failing.contains(&connection_id) || data.len() > self.max_packet_size {
            return false;
        }

        self.sent.push(SentPacket {
            connection_id,
            data: Bytes::copy_from_slice(data),
            channel,
        });
        true
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.inbound.pop_front()
    }
}
