//! Packs runs of same-type messages into size-bounded frames.
//!
//! A frame is `messageId:u16 | count:u32 | body x count`. A run that does not
//! fit one send buffer is split into consecutive chunks, one transport send
//! each. The first failed send marks the connection broken, requests its
//! disconnection and abandons the rest of the run; replicated state is resent
//! on the next interval anyway.

use crate::connection::ConnectionState;
use crate::debug;
use crate::error::{ReplicationError, Result};
use crate::protocol::{ConnectionId, MessageHeader, NetworkMessage};
use crate::serialization::NetworkWriter;
use crate::transport::{Channel, Transport, LOCAL_CONNECTION};

#[derive(Debug, Clone, Default)]
pub struct SendStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub suppressed_sends: u64,
}

/// How many `message_size` bodies fit one frame of `capacity` bytes.
pub fn messages_per_chunk(capacity: usize, message_size: usize) -> usize {
    capacity.saturating_sub(MessageHeader::SIZE) / message_size.max(1)
}

/// Owns the transport and the single reusable send buffer of a session.
pub struct MessageSender<T: Transport> {
    transport: T,
    writer: NetworkWriter,
    stats: SendStats,
}

impl<T: Transport> MessageSender<T> {
    pub fn new(transport: T, send_buffer_capacity: usize) -> Self {
        let capacity = send_buffer_capacity.min(transport.max_packet_size());

        Self {
            transport,
            writer: NetworkWriter::with_capacity(capacity),
            stats: SendStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.writer.capacity()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn get_stats(&self) -> &SendStats {
        &self.stats
    }

    /// Sends `messages` to one connection in as few frames as the buffer
    /// allows. Returns the number of frames sent.
    pub fn send_batch<M: NetworkMessage>(
        &mut self,
        connection: &mut ConnectionState,
        messages: &[M],
        channel: Channel,
    ) -> Result<usize> {
        if messages.is_empty() {
            return Ok(0);
        }

        let connection_id = connection.connection_id;

        if connection.broken {
            self.stats.suppressed_sends += 1;
            return Err(ReplicationError::ConnectionBroken(connection_id));
        }

        let per_chunk = messages_per_chunk(self.writer.capacity(), M::SIZE);
        if per_chunk == 0 {
            tracing::error!(
                "{} (0x{:04x}) is {} bytes and cannot fit a {} byte send buffer, dropping {} messages for connection {}",
                M::NAME, M::ID, M::SIZE, self.writer.capacity(), messages.len(), connection_id
            );
            return Err(ReplicationError::MessageTooLarge {
                message_id: M::ID,
                size: M::SIZE,
                capacity: self.writer.capacity(),
            });
        }

        let mut frames = 0;

        for chunk in messages.chunks(per_chunk) {
            let header = MessageHeader::new(M::ID, chunk.len() as u32);

            self.writer.reset();
            let written = self.writer.write_header(header)
                && chunk.iter().all(|message| self.writer.write(message));

            if !written {
                return Err(ReplicationError::MessageTooLarge {
                    message_id: M::ID,
                    size: M::SIZE,
                    capacity: self.writer.capacity(),
                });
            }

            if debug::is_debug_enabled() {
                for message in chunk {
                    debug::log_message("Outgoing", Some(connection_id), message);
                }
            }

            let len = self.writer.position();
            if !self.transport.send(Some(connection_id), self.writer.as_bytes(), channel) {
                connection.broken = true;
                self.stats.send_failures += 1;
                self.writer.reset();

                tracing::warn!(
                    "Send of {} to connection {} failed, marking broken and disconnecting",
                    debug::message_summary(&header),
                    connection_id
                );
                self.transport.disconnect(Some(connection_id));

                return Err(ReplicationError::SendFailed(connection_id));
            }

            self.stats.frames_sent += 1;
            self.stats.bytes_sent += len as u64;
            debug::trace_transport_send(len, Some(connection_id));
            frames += 1;
        }

        self.writer.reset();

        Ok(frames)
    }

    /// Sends one `messageId | body` frame, the client to server format.
    pub fn send_message<M: NetworkMessage>(
        &mut self,
        connection_id: Option<ConnectionId>,
        message: &M,
        channel: Channel,
    ) -> Result<()> {
        self.writer.reset();

        if !(self.writer.write_u16(M::ID) && self.writer.write(message)) {
            self.writer.reset();
            return Err(ReplicationError::MessageTooLarge {
                message_id: M::ID,
                size: 2 + M::SIZE,
                capacity: self.writer.capacity(),
            });
        }

        debug::log_message("Outgoing", connection_id, message);

        let len = self.writer.position();
        let sent = self.transport.send(connection_id, self.writer.as_bytes(), channel);
        self.writer.reset();

        if !sent {
            self.stats.send_failures += 1;
            return Err(ReplicationError::SendFailed(connection_id.unwrap_or(LOCAL_CONNECTION)));
        }

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += len as u64;
        debug::trace_transport_send(len, connection_id);

        Ok(())
    }
}
