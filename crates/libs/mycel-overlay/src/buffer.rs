//! Grow-on-append byte buffer used to assemble and parse overlay packets.
//!
//! Writers are big-endian. A write position can be checkpointed and rewound
//! to abandon a partially appended frame, and a hard size limit models the
//! interface MTU. Length fields whose value is unknown until the payload has
//! been written are reserved with [`OverlayBuffer::append_rfs`] and patched
//! in place afterwards; the width is fixed at reservation time so patching
//! never shifts bytes.

use crate::error::OverlayError;

/// Marker byte introducing a two-byte length field (lengths up to 64K).
const RFS_2BYTE: u8 = 0xFA;
/// Marker byte introducing a three-byte length field.
const RFS_3BYTE: u8 = 0xFB;
/// Largest length encodable in a single byte.
const RFS_SINGLE_MAX: usize = 249;

/// Total encoded width of a length field for `len`.
pub fn rfs_width(len: usize) -> usize {
    if len <= RFS_SINGLE_MAX {
        1
    } else if len < 0x1_0000 {
        3
    } else {
        4
    }
}

#[derive(Debug, Default)]
pub struct OverlayBuffer {
    bytes: Vec<u8>,
    position: usize,
    read_position: usize,
    size_limit: Option<usize>,
    checkpoint: Option<usize>,
    rfs_field: Option<(usize, usize)>,
}

impl OverlayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap received bytes for reading.
    pub fn wrap(bytes: Vec<u8>) -> Self {
        let position = bytes.len();
        Self { bytes, position, ..Self::default() }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.position]
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        self.bytes.truncate(self.position);
        self.bytes
    }

    pub fn limit_size(&mut self, limit: usize) {
        self.size_limit = Some(limit);
    }

    pub fn unlimit_size(&mut self) {
        self.size_limit = None;
    }

    /// Bytes still writable under the current limit.
    pub fn remaining(&self) -> usize {
        match self.size_limit {
            Some(limit) => limit.saturating_sub(self.position),
            None => usize::MAX,
        }
    }

    pub fn checkpoint(&mut self) {
        self.checkpoint = Some(self.position);
    }

    /// Restore the write position saved by the last [`Self::checkpoint`].
    pub fn rewind(&mut self) {
        if let Some(mark) = self.checkpoint.take() {
            self.position = mark;
            self.bytes.truncate(mark);
        }
    }

    fn make_space(&mut self, count: usize) -> Result<(), OverlayError> {
        if let Some(limit) = self.size_limit {
            if self.position + count > limit {
                return Err(OverlayError::OutOfSpace { limit });
            }
        }
        if self.bytes.len() < self.position + count {
            self.bytes.resize(self.position + count, 0);
        }
        Ok(())
    }

    pub fn append_byte(&mut self, byte: u8) -> Result<(), OverlayError> {
        self.make_space(1)?;
        self.bytes[self.position] = byte;
        self.position += 1;
        Ok(())
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<(), OverlayError> {
        self.make_space(bytes.len())?;
        self.bytes[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
        Ok(())
    }

    pub fn append_u16(&mut self, value: u16) -> Result<(), OverlayError> {
        self.append_bytes(&value.to_be_bytes())
    }

    pub fn append_u32(&mut self, value: u32) -> Result<(), OverlayError> {
        self.append_bytes(&value.to_be_bytes())
    }

    /// Reserve a length field wide enough for `max_len` and fill it with a
    /// placeholder. The actual length is written later by [`Self::patch_rfs`].
    pub fn append_rfs(&mut self, max_len: usize) -> Result<(), OverlayError> {
        let width = rfs_width(max_len);
        let offset = self.position;
        self.make_space(width)?;
        self.position += width;
        self.rfs_field = Some((offset, width));
        self.write_rfs(offset, width, max_len)
    }

    /// Rewrite the most recently reserved length field in place.
    pub fn patch_rfs(&mut self, len: usize) -> Result<(), OverlayError> {
        let (offset, width) = self.rfs_field.ok_or(OverlayError::RfsUnset)?;
        self.write_rfs(offset, width, len)
    }

    fn write_rfs(&mut self, offset: usize, width: usize, len: usize) -> Result<(), OverlayError> {
        if rfs_width(len) > width {
            return Err(OverlayError::RfsOverflow { len, width });
        }
        match width {
            1 => self.bytes[offset] = len as u8,
            3 => {
                self.bytes[offset] = RFS_2BYTE;
                self.bytes[offset + 1] = (len >> 8) as u8;
                self.bytes[offset + 2] = len as u8;
            }
            _ => {
                self.bytes[offset] = RFS_3BYTE;
                self.bytes[offset + 1] = (len >> 16) as u8;
                self.bytes[offset + 2] = (len >> 8) as u8;
                self.bytes[offset + 3] = len as u8;
            }
        }
        Ok(())
    }

    // reader half

    pub fn read_position(&self) -> usize {
        self.read_position
    }

    pub fn read_remaining(&self) -> usize {
        self.position.saturating_sub(self.read_position)
    }

    pub fn rewind_read(&mut self) {
        self.read_position = 0;
    }

    pub fn get_byte(&mut self) -> Result<u8, OverlayError> {
        if self.read_position >= self.position {
            return Err(OverlayError::Underflow { position: self.read_position });
        }
        let byte = self.bytes[self.read_position];
        self.read_position += 1;
        Ok(byte)
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<&[u8], OverlayError> {
        if self.read_position + count > self.position {
            return Err(OverlayError::Underflow { position: self.read_position });
        }
        let slice = &self.bytes[self.read_position..self.read_position + count];
        self.read_position += count;
        Ok(slice)
    }

    pub fn get_u16(&mut self) -> Result<u16, OverlayError> {
        let bytes = self.get_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, OverlayError> {
        let bytes = self.get_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_rfs(&mut self) -> Result<usize, OverlayError> {
        let first = self.get_byte()?;
        match first {
            RFS_2BYTE => {
                let bytes = self.get_bytes(2)?;
                Ok(((bytes[0] as usize) << 8) | bytes[1] as usize)
            }
            RFS_3BYTE => {
                let bytes = self.get_bytes(3)?;
                Ok(((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize)
            }
            len => Ok(len as usize),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writers_and_readers_mirror() {
        let mut buffer = OverlayBuffer::new();
        buffer.append_byte(0x42).expect("append");
        buffer.append_u16(0x1234).expect("append");
        buffer.append_u32(0xdeadbeef).expect("append");
        buffer.append_bytes(b"tail").expect("append");

        let mut reader = OverlayBuffer::wrap(buffer.into_bytes());
        assert_eq!(reader.get_byte().expect("read"), 0x42);
        assert_eq!(reader.get_u16().expect("read"), 0x1234);
        assert_eq!(reader.get_u32().expect("read"), 0xdeadbeef);
        assert_eq!(reader.get_bytes(4).expect("read"), b"tail");
        assert!(matches!(reader.get_byte(), Err(OverlayError::Underflow { .. })));
    }

    #[test]
    fn size_limit_caps_appends() {
        let mut buffer = OverlayBuffer::new();
        buffer.limit_size(4);
        buffer.append_bytes(&[1, 2, 3]).expect("fits");
        assert_eq!(buffer.remaining(), 1);
        assert!(matches!(
            buffer.append_bytes(&[4, 5]),
            Err(OverlayError::OutOfSpace { limit: 4 })
        ));
        // a failed append leaves the buffer untouched
        assert_eq!(buffer.as_slice(), &[1, 2, 3]);
        buffer.unlimit_size();
        buffer.append_bytes(&[4, 5]).expect("uncapped");
    }

    #[test]
    fn checkpoint_rewind_discards_partial_frame() {
        let mut buffer = OverlayBuffer::new();
        buffer.append_bytes(b"keep").expect("append");
        buffer.checkpoint();
        buffer.append_bytes(b"discard").expect("append");
        buffer.rewind();
        assert_eq!(buffer.as_slice(), b"keep");
    }

    #[test]
    fn rfs_widths() {
        assert_eq!(rfs_width(0), 1);
        assert_eq!(rfs_width(249), 1);
        assert_eq!(rfs_width(250), 3);
        assert_eq!(rfs_width(0xFFFF), 3);
        assert_eq!(rfs_width(0x10000), 4);
    }

    #[test]
    fn rfs_patch_does_not_shift_bytes() {
        let mut buffer = OverlayBuffer::new();
        buffer.append_byte(0x10).expect("append");
        buffer.append_rfs(1200).expect("reserve");
        let before = buffer.position();
        buffer.append_bytes(&[0u8; 90]).expect("payload");
        buffer.patch_rfs(90).expect("patch");
        assert_eq!(buffer.position(), before + 90);

        let mut reader = OverlayBuffer::wrap(buffer.into_bytes());
        assert_eq!(reader.get_byte().expect("type"), 0x10);
        assert_eq!(reader.get_rfs().expect("len"), 90);
    }

    #[test]
    fn rfs_roundtrip_all_widths() {
        for len in [0usize, 1, 249, 250, 1200, 0xFFFF, 0x10000, 0x123456] {
            let mut buffer = OverlayBuffer::new();
            buffer.append_rfs(len).expect("reserve");
            buffer.patch_rfs(len).expect("patch");
            let mut reader = OverlayBuffer::wrap(buffer.into_bytes());
            assert_eq!(reader.get_rfs().expect("read"), len, "len={len}");
        }
    }

    #[test]
    fn rfs_patch_rejects_wider_value() {
        let mut buffer = OverlayBuffer::new();
        buffer.append_rfs(100).expect("reserve single byte");
        assert!(matches!(
            buffer.patch_rfs(300),
            Err(OverlayError::RfsOverflow { .. })
        ));
    }
}
