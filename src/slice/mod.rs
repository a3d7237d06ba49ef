//! Chunk slice logs: the record format, the overlap resolver and the compactor.

pub mod compact;
pub mod interval;
pub mod resolve;

use tracing::warn;

pub use compact::{compact_chunk, compact_window, skip_some, Compaction};
pub use resolve::{build_slices, resolve_segments, Fill, Segment};

/// Logical chunk size; `pos` and `len` of a slice never exceed it.
pub const CHUNK_SIZE: u32 = 1 << 26;

/// Size of one encoded slice record.
pub const SLICE_BYTES: usize = 24;

/// One entry of a chunk log. `id == 0` is a hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slice {
    pub pos: u32,
    pub id: u64,
    pub size: u32,
    pub off: u32,
    pub len: u32,
}

impl Slice {
    pub fn new(pos: u32, id: u64, size: u32, off: u32, len: u32) -> Self {
        Self {
            pos,
            id,
            size,
            off,
            len,
        }
    }

    /// A freshly written slice covering its whole object.
    pub fn written(pos: u32, id: u64, len: u32) -> Self {
        Self::new(pos, id, len, 0, len)
    }

    pub fn hole(pos: u32, len: u32) -> Self {
        Self::new(pos, 0, 0, 0, len)
    }

    pub fn is_hole(&self) -> bool {
        self.id == 0
    }

    pub fn end(&self) -> u32 {
        self.pos.saturating_add(self.len)
    }

    pub fn encode(&self) -> [u8; SLICE_BYTES] {
        let mut buf = [0u8; SLICE_BYTES];
        buf[0..4].copy_from_slice(&self.pos.to_be_bytes());
        buf[4..12].copy_from_slice(&self.id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.size.to_be_bytes());
        buf[16..20].copy_from_slice(&self.off.to_be_bytes());
        buf[20..24].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    fn decode_record(buf: &[u8]) -> Self {
        let u32_at = |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[4..12]);
        Self {
            pos: u32_at(0),
            id: u64::from_be_bytes(id),
            size: u32_at(12),
            off: u32_at(16),
            len: u32_at(20),
        }
    }
}

/// Decode a chunk log. A trailing partial record is reported and dropped.
pub fn decode_slices(buf: &[u8]) -> Vec<Slice> {
    let rest = buf.len() % SLICE_BYTES;
    if rest != 0 {
        warn!(
            "chunk log has {} trailing bytes out of {}, ignoring them",
            rest,
            buf.len()
        );
    }
    buf.chunks_exact(SLICE_BYTES).map(Slice::decode_record).collect()
}

pub fn encode_slices(slices: &[Slice]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(slices.len() * SLICE_BYTES);
    for s in slices {
        buf.extend_from_slice(&s.encode());
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_is_big_endian() {
        let s = Slice::new(1, 0x0102_0304_0506_0708, 3, 4, 5);
        let buf = s.encode();
        assert_eq!(&buf[0..4], &[0, 0, 0, 1]);
        assert_eq!(&buf[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&buf[20..24], &[0, 0, 0, 5]);
        assert_eq!(decode_slices(&buf), vec![s]);
    }

    #[test]
    fn trailing_garbage_is_dropped() {
        let mut buf = encode_slices(&[Slice::written(0, 9, 100), Slice::hole(100, 20)]);
        buf.extend_from_slice(&[0xff; 7]);
        let slices = decode_slices(&buf);
        assert_eq!(slices.len(), 2);
        assert!(slices[1].is_hole());
    }
}
