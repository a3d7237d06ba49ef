use super::interval::{Extent, Interval};
use super::Slice;

/// What a resolved range shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Nothing in the log covers these bytes.
    Gap,
    /// Bytes come from log entry `seq`; `id == 0` is an explicit hole.
    Data {
        seq: usize,
        id: u64,
        size: u32,
        off: u32,
    },
}

impl Extent for Fill {
    fn gap() -> Self {
        Fill::Gap
    }

    fn advance(&self, delta: u32) -> Self {
        match *self {
            Fill::Gap => Fill::Gap,
            Fill::Data { seq, id, size, off } => Fill::Data {
                seq,
                id,
                size,
                off: off + delta,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub pos: u32,
    pub len: u32,
    pub fill: Fill,
}

impl Segment {
    pub fn end(&self) -> u32 {
        self.pos + self.len
    }

    /// Log position of the entry that wrote these bytes, if any.
    pub fn seq(&self) -> Option<usize> {
        match self.fill {
            Fill::Gap => None,
            Fill::Data { seq, .. } => Some(seq),
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self.fill, Fill::Data { id, .. } if id != 0)
    }

    fn to_slice(self) -> Slice {
        match self.fill {
            Fill::Data { id, size, off, .. } if id != 0 => Slice::new(self.pos, id, size, off, self.len),
            _ => Slice::hole(self.pos, self.len),
        }
    }
}

/// Fold `log` into visible segments, later entries winning. Entry `i` is
/// tagged with sequence `base + i`.
pub fn resolve_segments(log: &[Slice], base: usize) -> Vec<Segment> {
    let root = Interval::fold(log.iter().enumerate().map(|(i, s)| {
        (
            s.pos,
            s.len,
            Fill::Data {
                seq: base + i,
                id: s.id,
                size: s.size,
                off: s.off,
            },
        )
    }));
    let mut out = Vec::new();
    if let Some(node) = &root {
        node.visit(&mut |pos, len, fill: &Fill| {
            out.push(Segment {
                pos,
                len,
                fill: *fill,
            })
        });
    }
    out
}

/// Visible content of a chunk: contiguous slices from 0 to the highest
/// written offset, unwritten ranges reported as holes.
pub fn build_slices(log: &[Slice]) -> Vec<Slice> {
    let segments = resolve_segments(log, 0);
    let mut out = Vec::with_capacity(segments.len() + 1);
    if let Some(first) = segments.first() {
        if first.pos > 0 {
            out.push(Slice::hole(0, first.pos));
        }
    }
    for seg in segments {
        let slice = seg.to_slice();
        match out.last_mut() {
            Some(prev) if prev.is_hole() && slice.is_hole() => prev.len += slice.len,
            _ => out.push(slice),
        }
    }
    out
}

/// Byte-level view of a log: for each offset, the object id and offset
/// within that object, or `None` for zeros. Brute force; tests compare
/// the tree resolver and the compactor against it.
#[cfg(test)]
pub(crate) fn paint(log: &[Slice]) -> Vec<Option<(u64, u32)>> {
    let end = log.iter().map(|s| s.end()).max().unwrap_or(0) as usize;
    let mut bytes = vec![None; end];
    for s in log {
        for k in 0..s.len {
            bytes[(s.pos + k) as usize] = if s.is_hole() {
                None
            } else {
                Some((s.id, s.off + k))
            };
        }
    }
    bytes
}

#[cfg(test)]
pub(crate) fn random_log(rng: &mut impl rand::Rng, n: usize, span: u32) -> Vec<Slice> {
    (0..n)
        .map(|i| {
            let pos = rng.gen_range(0..span);
            let len = rng.gen_range(1..=span / 4);
            if rng.gen_ratio(1, 10) {
                Slice::hole(pos, len)
            } else {
                let off = rng.gen_range(0..8);
                Slice::new(pos, 1000 + i as u64, off + len + 3, off, len)
            }
        })
        .collect()
}
