//! Sync cursors: a half-open window over the two-dimensional key
//! `(payload_size, bundle_id)` that bounds one reconciliation slice. The
//! limit fields record how far a produced slice actually reached, and a
//! 10-byte pickled form travels on the wire so the peer can request or
//! acknowledge a delta.

use crate::error::RhizomeError;

pub const CURSOR_PICKLE_BYTES: usize = 10;
const PICKLED_BID_PREFIX: usize = 4;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SyncCursor {
    pub size_low: u64,
    pub bid_low: [u8; 32],
    pub size_high: u64,
    pub bid_high: [u8; 32],
    /// High edge of the last slice actually produced within the window.
    pub limit_size_high: u64,
    pub limit_bid_high: [u8; 32],
}

impl Default for SyncCursor {
    fn default() -> Self {
        Self {
            size_low: 0,
            bid_low: [0u8; 32],
            size_high: u64::MAX,
            bid_high: [0xFF; 32],
            limit_size_high: 0,
            limit_bid_high: [0u8; 32],
        }
    }
}

impl SyncCursor {
    /// A cursor spanning the whole store.
    pub fn full_range() -> Self {
        Self::default()
    }

    /// 10-byte wire form: 48-bit big-endian `limit_size_high` plus the
    /// first four bytes of `limit_bid_high`.
    pub fn pickle(&self) -> [u8; CURSOR_PICKLE_BYTES] {
        let mut out = [0u8; CURSOR_PICKLE_BYTES];
        out[..6].copy_from_slice(&self.limit_size_high.to_be_bytes()[2..]);
        out[6..].copy_from_slice(&self.limit_bid_high[..PICKLED_BID_PREFIX]);
        out
    }

    /// Parse a pickled range into `(limit_size_high, limit_bid_high)`; the
    /// bid tail beyond the carried prefix is zero.
    pub fn unpickle(bytes: &[u8]) -> Result<(u64, [u8; 32]), RhizomeError> {
        if bytes.len() < CURSOR_PICKLE_BYTES {
            return Err(RhizomeError::Parse(format!(
                "pickled cursor needs {CURSOR_PICKLE_BYTES} bytes, got {}",
                bytes.len()
            )));
        }
        let mut size_bytes = [0u8; 8];
        size_bytes[2..].copy_from_slice(&bytes[..6]);
        let mut bid = [0u8; 32];
        bid[..PICKLED_BID_PREFIX].copy_from_slice(&bytes[6..CURSOR_PICKLE_BYTES]);
        Ok((u64::from_be_bytes(size_bytes), bid))
    }

    /// Advance past a range the far end reported covered: all bundle ids
    /// under the returned prefix are done, so the low bid tail saturates.
    pub fn advance(&mut self, pickled: &[u8]) -> Result<(), RhizomeError> {
        let (size_high, bid_high) = Self::unpickle(pickled)?;
        self.size_low = size_high;
        self.bid_low[..PICKLED_BID_PREFIX].copy_from_slice(&bid_high[..PICKLED_BID_PREFIX]);
        for byte in &mut self.bid_low[PICKLED_BID_PREFIX..] {
            *byte = 0xFF;
        }
        Ok(())
    }

    /// Whether a `(size, bid)` pair falls inside this window.
    pub fn contains(&self, size: u64, bid: &[u8]) -> bool {
        if size < self.size_low || size > self.size_high {
            return false;
        }
        if size == self.size_low && bid <= &self.bid_low[..bid.len().min(32)] {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pickle_unpickle_roundtrip() {
        let mut cursor = SyncCursor::full_range();
        cursor.limit_size_high = 0x1234_5678_9A;
        cursor.limit_bid_high = [0xCD; 32];

        let pickled = cursor.pickle();
        let (size, bid) = SyncCursor::unpickle(&pickled).expect("unpickle");
        assert_eq!(size, cursor.limit_size_high);
        assert_eq!(&bid[..4], &cursor.limit_bid_high[..4]);
        assert_eq!(&bid[4..], &[0u8; 28]);
    }

    #[test]
    fn advance_saturates_bid_tail() {
        let mut cursor = SyncCursor::full_range();
        let mut done = SyncCursor::full_range();
        done.limit_size_high = 4096;
        done.limit_bid_high = [0xAA; 32];

        cursor.advance(&done.pickle()).expect("advance");
        assert_eq!(cursor.size_low, 4096);
        assert_eq!(&cursor.bid_low[..4], &[0xAA; 4]);
        assert!(cursor.bid_low[4..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn short_pickle_is_rejected() {
        assert!(SyncCursor::unpickle(&[0u8; 6]).is_err());
    }

    #[test]
    fn containment_respects_low_edge() {
        let mut cursor = SyncCursor::full_range();
        cursor.size_low = 100;
        cursor.bid_low = [0x80; 32];
        assert!(!cursor.contains(50, &[0x00; 32]));
        assert!(!cursor.contains(100, &[0x10; 32]));
        assert!(cursor.contains(100, &[0x90; 32]));
        assert!(cursor.contains(200, &[0x00; 32]));
    }
}
