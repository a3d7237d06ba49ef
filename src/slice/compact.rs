//! Choosing and describing the compaction of a chunk log.
//!
//! A compaction folds the entries `log[head..tail]` into a single new object.
//! Entries before `head` stay as they are underneath the result and entries
//! from `tail` on stay on top of it, so only the bytes of the window that are
//! still visible through the suffix need to be copied.

use std::collections::HashSet;

use super::resolve::{resolve_segments, Fill, Segment};
use super::Slice;

/// Untouched entries a trimmed window may leave on either side, in total.
pub const MAX_STABLE_SLICES: usize = 20;

/// Smallest saving that justifies copying an extra visible entry.
pub const MIN_REDUCED_BYTES: i64 = 2 << 20;

/// One piece of source data copied into the compacted object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Source {
    pub id: u64,
    pub size: u32,
    pub off: u32,
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compaction {
    pub head: usize,
    pub tail: usize,
    /// Chunk offset of the first byte kept from the window.
    pub pos: u32,
    /// Bytes that must be copied into the new object.
    pub write: u64,
    /// Bytes of source objects no longer referenced once the window is gone.
    pub delete: u64,
    /// Window bytes still visible after the suffix is applied, by position.
    pub kept: Vec<Segment>,
}

impl Compaction {
    pub fn window(&self) -> usize {
        self.tail - self.head
    }

    pub fn reduced(&self) -> i64 {
        self.delete as i64 - self.write as i64
    }

    /// Whether applying this compaction shrinks anything.
    pub fn is_useful(&self) -> bool {
        self.window() >= 2 || (self.window() == 1 && self.reduced() > 0)
    }

    /// Pieces to concatenate into the new object, in object order.
    pub fn sources(&self) -> Vec<Source> {
        self.kept
            .iter()
            .filter_map(|seg| match seg.fill {
                Fill::Data { id, size, off, .. } if id != 0 => Some(Source {
                    id,
                    size,
                    off,
                    len: seg.len,
                }),
                _ => None,
            })
            .collect()
    }

    /// Log entries replacing the window when the merged object is `new_id`.
    /// Adjacent data ranges share one entry; explicit holes stay holes.
    pub fn layout(&self, new_id: u64) -> Vec<Slice> {
        let size = self.write as u32;
        let mut out: Vec<Slice> = Vec::new();
        let mut cursor = 0u32;
        for seg in &self.kept {
            if seg.is_data() {
                match out.last_mut() {
                    Some(prev) if prev.id == new_id && prev.end() == seg.pos => prev.len += seg.len,
                    _ => out.push(Slice::new(seg.pos, new_id, size, cursor, seg.len)),
                }
                cursor += seg.len;
            } else {
                match out.last_mut() {
                    Some(prev) if prev.is_hole() && prev.end() == seg.pos => prev.len += seg.len,
                    _ => out.push(Slice::hole(seg.pos, seg.len)),
                }
            }
        }
        out
    }

    /// The whole log after the window is swapped for `layout(new_id)`.
    pub fn apply(&self, log: &[Slice], new_id: u64) -> Vec<Slice> {
        let mut out = log[..self.head].to_vec();
        out.extend(self.layout(new_id));
        out.extend_from_slice(&log[self.tail..]);
        out
    }

    /// Source entries of the window; each one drops a reference.
    pub fn dropped<'a>(&self, log: &'a [Slice]) -> impl Iterator<Item = &'a Slice> {
        log[self.head..self.tail].iter().filter(|s| !s.is_hole())
    }
}

/// Describe folding `log[head..tail]` into one object.
pub fn compact_window(log: &[Slice], head: usize, tail: usize) -> Compaction {
    let segments = resolve_segments(&log[head..], head);
    let kept: Vec<Segment> = segments
        .into_iter()
        .filter(|seg| match seg.fill {
            Fill::Gap => false,
            // With nothing underneath, a hole reads the same as a gap.
            Fill::Data { seq, id, .. } => seq < tail && (id != 0 || head > 0),
        })
        .collect();

    let write = kept
        .iter()
        .filter(|seg| seg.is_data())
        .map(|seg| u64::from(seg.len))
        .sum();

    let outside: HashSet<(u64, u32)> = log[..head]
        .iter()
        .chain(&log[tail..])
        .filter(|s| !s.is_hole())
        .map(|s| (s.id, s.size))
        .collect();
    let mut gone: HashSet<(u64, u32)> = HashSet::new();
    let mut delete = 0u64;
    for s in &log[head..tail] {
        let key = (s.id, s.size);
        if !s.is_hole() && !outside.contains(&key) && gone.insert(key) {
            delete += u64::from(s.size);
        }
    }

    Compaction {
        head,
        tail,
        pos: kept.first().map(|seg| seg.pos).unwrap_or(0),
        write,
        delete,
        kept,
    }
}

/// Compact everything after a stable prefix of `skip` entries.
pub fn compact_chunk(log: &[Slice], skip: usize) -> Compaction {
    compact_window(log, skip, log.len())
}

/// Whether `entry`, on the edge of window `with`, should be folded rather
/// than left in place (`without` is the window that leaves it out).
fn worth_folding(entry: &Slice, with: &Compaction, without: &Compaction) -> bool {
    let extra_write = with.write.saturating_sub(without.write);
    if extra_write == 0 {
        return true;
    }
    let reduced = with.reduced() - without.reduced();
    reduced >= i64::from(entry.len)
        && reduced * 5 >= with.write as i64
        && reduced >= MIN_REDUCED_BYTES
}

/// Pick the window `[head, tail)` worth compacting: entries on either edge
/// whose copy costs more than it frees are left in place, up to
/// `MAX_STABLE_SLICES` of them.
pub fn skip_some(log: &[Slice]) -> (usize, usize) {
    let mut head = 0;
    let mut tail = log.len();
    while tail - head > 1 && head < MAX_STABLE_SLICES {
        let with = compact_window(log, head, tail);
        let without = compact_window(log, head + 1, tail);
        if worth_folding(&log[head], &with, &without) {
            break;
        }
        head += 1;
    }
    while tail - head > 1 && head + (log.len() - tail) < MAX_STABLE_SLICES {
        let with = compact_window(log, head, tail);
        let without = compact_window(log, head, tail - 1);
        if worth_folding(&log[tail - 1], &with, &without) {
            break;
        }
        tail -= 1;
    }
    (head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::resolve::{paint, random_log};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const NEW_ID: u64 = 1 << 40;

    /// Visible bytes of `log` with the merged object expanded back into the
    /// source bytes it was built from.
    fn materialize(log: &[Slice], sources: &[Source]) -> Vec<Option<(u64, u32)>> {
        let mut merged = Vec::new();
        for src in sources {
            for k in 0..src.len {
                merged.push((src.id, src.off + k));
            }
        }
        let mut bytes: Vec<Option<(u64, u32)>> = paint(log)
            .into_iter()
            .map(|b| match b {
                Some((id, off)) if id == NEW_ID => Some(merged[off as usize]),
                other => other,
            })
            .collect();
        while bytes.last() == Some(&None) {
            bytes.pop();
        }
        bytes
    }

    #[test]
    fn full_compaction_of_overwritten_chunk() {
        let log = vec![Slice::written(0, 10, 100), Slice::written(50, 20, 50)];
        let c = compact_chunk(&log, 0);
        assert_eq!(c.pos, 0);
        assert_eq!(c.write, 100);
        assert_eq!(c.delete, 150);
        assert_eq!(c.reduced(), 50);
        assert_eq!(c.layout(NEW_ID), vec![Slice::written(0, NEW_ID, 100)]);
        assert_eq!(
            c.sources(),
            vec![
                Source { id: 10, size: 100, off: 0, len: 50 },
                Source { id: 20, size: 50, off: 0, len: 50 },
            ]
        );
    }

    #[test]
    fn window_keeps_only_what_the_suffix_leaves_visible() {
        let log = vec![
            Slice::written(0, 1, 100),
            Slice::written(0, 2, 100),
            Slice::written(0, 3, 40),
        ];
        let c = compact_window(&log, 0, 2);
        assert_eq!(c.pos, 40);
        assert_eq!(c.write, 60);
        assert_eq!(c.delete, 200);
        assert_eq!(
            c.apply(&log, NEW_ID),
            vec![
                Slice::new(40, NEW_ID, 60, 0, 60),
                Slice::written(0, 3, 40),
            ]
        );
    }

    #[test]
    fn shared_source_is_not_deleted() {
        // The same object shows up again after the window.
        let log = vec![
            Slice::written(0, 7, 10),
            Slice::written(20, 8, 10),
            Slice::new(40, 7, 10, 0, 10),
        ];
        let c = compact_window(&log, 0, 2);
        assert_eq!(c.delete, 10);
    }

    #[test]
    fn holes_over_a_stable_prefix_are_kept() {
        let log = vec![
            Slice::written(0, 1, 100),
            Slice::written(0, 2, 30),
            Slice::hole(30, 20),
        ];
        let c = compact_window(&log, 1, 3);
        assert_eq!(c.write, 30);
        assert_eq!(
            c.layout(NEW_ID),
            vec![Slice::written(0, NEW_ID, 30), Slice::hole(30, 20)]
        );

        let full = compact_window(&log, 0, 3);
        assert!(full.layout(NEW_ID).iter().all(|s| !s.is_hole()));
    }

    #[test]
    fn many_tiny_overwrites_collapse_to_one_entry() {
        let log: Vec<Slice> = (0..300).map(|i| Slice::written(0, 100 + i, 1)).collect();
        let (head, tail) = skip_some(&log);
        assert_eq!((head, tail), (0, 299));

        let c = compact_window(&log, head, tail);
        assert_eq!(c.write, 0);
        assert_eq!(c.delete, 299);
        assert!(c.is_useful());
        let after = c.apply(&log, NEW_ID);
        assert_eq!(after, vec![Slice::written(0, 399, 1)]);
    }

    #[test]
    fn large_untouched_head_is_skipped() {
        // A big base object with a few small overwrites on top. Copying the
        // base frees next to nothing and neither does copying the newest
        // entry, so both stay out of the window.
        let big = 8 << 20;
        let mut log = vec![Slice::written(0, 1, big)];
        for i in 0..4u32 {
            log.push(Slice::written(i * 4096, 10 + u64::from(i), 100));
            log.push(Slice::written(i * 4096, 20 + u64::from(i), 100));
        }
        let (head, tail) = skip_some(&log);
        assert_eq!((head, tail), (1, log.len() - 1));
        let c = compact_window(&log, head, tail);
        assert_eq!(c.write, 300);
        assert_eq!(c.delete, 700);
    }

    #[test]
    fn single_entry_without_savings_is_not_useful() {
        let log = vec![Slice::written(0, 5, 4096)];
        let c = compact_chunk(&log, 0);
        assert!(!c.is_useful());
    }

    #[test]
    fn trimmed_compaction_preserves_content() {
        let mut rng = StdRng::seed_from_u64(21);
        for _ in 0..200 {
            let n = rng.gen_range(1..30);
            let log = random_log(&mut rng, n, 400);
            let head = rng.gen_range(0..n);
            let tail = rng.gen_range(head + 1..=n);
            let c = compact_window(&log, head, tail);
            let after = c.apply(&log, NEW_ID);
            assert_eq!(
                materialize(&after, &c.sources()),
                materialize(&log, &[]),
                "window {head}..{tail} of {log:?}"
            );
            assert_eq!(
                c.layout(NEW_ID).iter().filter(|s| !s.is_hole()).map(|s| u64::from(s.len)).sum::<u64>(),
                c.write
            );
        }
    }

    #[test]
    fn skip_some_window_preserves_content() {
        let mut rng = StdRng::seed_from_u64(22);
        for _ in 0..50 {
            let log = random_log(&mut rng, 40, 300);
            let (head, tail) = skip_some(&log);
            assert!(head < tail);
            let c = compact_window(&log, head, tail);
            let after = c.apply(&log, NEW_ID);
            assert_eq!(materialize(&after, &c.sources()), materialize(&log, &[]));
        }
    }
}
