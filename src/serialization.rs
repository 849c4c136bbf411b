//! Bounds-checked writer and reader for fixed-layout messages.
//!
//! Every write either lands completely or leaves the buffer untouched, and
//! every read either consumes the full value or nothing. Callers treat a
//! failed read as a protocol violation.

use crate::protocol::{MessageHeader, MessageId, NetworkMessage};
use bytes::{Buf, BufMut, BytesMut};

/// Reusable send buffer with a hard capacity. The allocation is made once and
/// cleared between frames; it never grows past `capacity`.
pub struct NetworkWriter {
    buffer: BytesMut,
    capacity: usize,
}

impl NetworkWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn position(&self) -> usize {
        self.buffer.len()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn write<M: NetworkMessage>(&mut self, value: &M) -> bool {
        if self.remaining() < M::SIZE {
            return false;
        }
        value.encode(&mut self.buffer);
        true
    }

    pub fn write_u16(&mut self, value: u16) -> bool {
        if self.remaining() < 2 {
            return false;
        }
        self.buffer.put_u16_le(value);
        true
    }

    pub fn write_u32(&mut self, value: u32) -> bool {
        if self.remaining() < 4 {
            return false;
        }
        self.buffer.put_u32_le(value);
        true
    }

    pub fn write_header(&mut self, header: MessageHeader) -> bool {
        if self.remaining() < MessageHeader::SIZE {
            return false;
        }
        self.buffer.put_u16_le(header.message_id);
        self.buffer.put_u32_le(header.count);
        true
    }

    /// Writes a `u32` length prefix followed by `data`.
    pub fn write_blob(&mut self, data: &[u8]) -> bool {
        if data.len() > u32::MAX as usize || self.remaining() < 4 + data.len() {
            return false;
        }
        self.buffer.put_u32_le(data.len() as u32);
        self.buffer.put_slice(data);
        true
    }
}

/// Cursor over one received segment.
pub struct NetworkReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> NetworkReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    pub fn read<M: NetworkMessage>(&mut self) -> Option<M> {
        if self.remaining() < M::SIZE {
            return None;
        }
        let mut body = &self.rest()[..M::SIZE];
        let value = M::decode(&mut body);
        self.position += M::SIZE;
        Some(value)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        let value = self.peek_u16()?;
        self.position += 2;
        Some(value)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let value = self.peek_u32()?;
        self.position += 4;
        Some(value)
    }

    pub fn peek_u16(&self) -> Option<u16> {
        if self.remaining() < 2 {
            return None;
        }
        Some(self.rest().get_u16_le())
    }

    pub fn peek_u32(&self) -> Option<u32> {
        if self.remaining() < 4 {
            return None;
        }
        Some(self.rest().get_u32_le())
    }

    pub fn read_message_id(&mut self) -> Option<MessageId> {
        self.read_u16()
    }

    pub fn read_header(&mut self) -> Option<MessageHeader> {
        if self.remaining() < MessageHeader::SIZE {
            return None;
        }
        let mut rest = self.rest();
        let message_id = rest.get_u16_le();
        let count = rest.get_u32_le();
        self.position += MessageHeader::SIZE;
        Some(MessageHeader { message_id, count })
    }

    /// Length of the next size-prefixed blob, without consuming anything.
    pub fn peek_blob_len(&self) -> Option<usize> {
        self.peek_u32().map(|len| len as usize)
    }

    pub fn read_blob(&mut self) -> Option<&'a [u8]> {
        let len = self.peek_blob_len()?;
        if self.remaining() < 4 + len {
            return None;
        }
        let start = self.position + 4;
        let blob = &self.data[start..start + len];
        self.position = start + len;
        Some(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NetId, TransformMessage, UnspawnMessage};
    use glam::Vec3;

    #[test]
    fn test_write_fails_without_room() {
        let mut writer = NetworkWriter::with_capacity(10);

        assert!(writer.write(&UnspawnMessage { net_id: NetId(1) }));
        assert_eq!(writer.position(), 8);

        assert!(!writer.write(&UnspawnMessage { net_id: NetId(2) }));
        assert_eq!(writer.position(), 8);

        assert!(writer.write_u16(0xABCD));
        assert!(!writer.write_u16(1));
        assert_eq!(writer.remaining(), 0);
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut writer = NetworkWriter::with_capacity(64);
        assert!(writer.write_header(MessageHeader::new(0x22, 3)));
        writer.reset();
        assert_eq!(writer.position(), 0);
        assert_eq!(writer.remaining(), 64);
    }

    #[test]
    fn test_header_layout() {
        let mut writer = NetworkWriter::with_capacity(16);
        assert!(writer.write_header(MessageHeader::new(0x0023, 2)));
        assert_eq!(writer.as_bytes(), &[0x23, 0x00, 0x02, 0x00, 0x00, 0x00]);

        let mut reader = NetworkReader::new(writer.as_bytes());
        assert_eq!(reader.read_header(), Some(MessageHeader::new(0x0023, 2)));
        assert!(reader.is_empty());
    }

    #[test]
    fn test_truncated_read_consumes_nothing() {
        let mut writer = NetworkWriter::with_capacity(64);
        let transform = TransformMessage {
            net_id: NetId(9),
            position: Vec3::new(1.0, 2.0, 3.0),
            rotation: 5,
        };
        assert!(writer.write(&transform));

        let bytes = &writer.as_bytes()[..TransformMessage::SIZE - 1];
        let mut reader = NetworkReader::new(bytes);
        assert!(reader.read::<TransformMessage>().is_none());
        assert_eq!(reader.position(), 0);

        let mut reader = NetworkReader::new(writer.as_bytes());
        assert_eq!(reader.read::<TransformMessage>(), Some(transform));
        assert!(reader.read::<TransformMessage>().is_none());
    }

    #[test]
    fn test_partial_header_is_rejected() {
        let data = [0x22, 0x00, 0x01];
        let mut reader = NetworkReader::new(&data);
        assert!(reader.read_header().is_none());
        assert_eq!(reader.position(), 0);
        assert_eq!(reader.read_message_id(), Some(0x22));
    }

    #[test]
    fn test_blob_peek_and_read() {
        let mut writer = NetworkWriter::with_capacity(32);
        assert!(writer.write_blob(b"hello"));
        assert!(!writer.write_blob(&[0u8; 32]));

        let mut reader = NetworkReader::new(writer.as_bytes());
        assert_eq!(reader.peek_blob_len(), Some(5));
        assert_eq!(reader.position(), 0);
        assert_eq!(reader.read_blob(), Some(&b"hello"[..]));
        assert!(reader.is_empty());
    }

    #[test]
    fn test_blob_with_short_payload() {
        let data = [10u8, 0, 0, 0, 1, 2, 3];
        let mut reader = NetworkReader::new(&data);
        assert_eq!(reader.peek_blob_len(), Some(10));
        assert!(reader.read_blob().is_none());
        assert_eq!(reader.position(), 0);
    }
}
