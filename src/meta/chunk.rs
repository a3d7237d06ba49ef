//! Chunk logs: writes, reads, truncation, compaction and slice garbage.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::attr::{align4k, FileKind};
use super::namespace::load_attr;
use super::{Ino, Meta};
use crate::context::Context;
use crate::error::{MetaError, Result};
use crate::kv::{keys, KvTxn};
use crate::slice::{build_slices, compact_window, decode_slices, encode_slices, skip_some, Slice, CHUNK_SIZE, SLICE_BYTES};

/// What a call to [`Meta::compact_chunk`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CompactOutcome {
    /// Another compaction of the chunk is running, or too many are.
    Skipped,
    /// The log is already as small as the policy wants it.
    Nothing,
    /// The log changed underneath; the merged object was thrown away.
    Abandoned,
    Compacted {
        head: usize,
        tail: usize,
        new_id: u64,
        write: u64,
        delete: u64,
    },
}

/// Removes the chunk from the in-flight set when the compaction ends.
struct CompactGuard<'a> {
    meta: &'a Meta,
    key: (Ino, u32),
}

impl Drop for CompactGuard<'_> {
    fn drop(&mut self) {
        self.meta.compacting.lock().remove(&self.key);
    }
}

/// Drop one reference from each non-hole entry of `dropped`. Returns the
/// slices left without references.
fn release_refs<'a>(tx: &mut dyn KvTxn, dropped: impl Iterator<Item = &'a Slice>) -> Result<Vec<(u64, u32)>> {
    let mut counts: HashMap<(u64, u32), i64> = HashMap::new();
    for s in dropped.filter(|s| !s.is_hole()) {
        *counts.entry((s.id, s.size)).or_default() += 1;
    }
    let mut dead = Vec::new();
    for ((id, size), n) in counts {
        if tx.incr_by(&keys::slice_ref(id, size), -n)? < 0 {
            dead.push((id, size));
        }
    }
    dead.sort_unstable();
    Ok(dead)
}

impl Meta {
    pub fn new_slice_id(&self, ctx: &Context) -> Result<u64> {
        let v = self
            .txn
            .txn(ctx, |tx| tx.incr_by(&keys::counter(keys::NEXT_SLICE), 1))?;
        Ok(v as u64)
    }

    /// Append `slice` to chunk `indx` of file `ino`, growing the file if the
    /// slice ends past it.
    pub fn write_chunk(&self, ctx: &Context, ino: Ino, indx: u32, slice: Slice) -> Result<()> {
        if slice.is_hole() || slice.len == 0 {
            return Err(MetaError::Invalid("empty slice".into()));
        }
        if u64::from(slice.pos) + u64::from(slice.len) > u64::from(CHUNK_SIZE)
            || u64::from(slice.off) + u64::from(slice.len) > u64::from(slice.size)
        {
            return Err(MetaError::Invalid(format!("slice {slice:?} out of bounds")));
        }
        let key = keys::chunk(ino, indx);
        let (attr, space, entries) = self.txn.txn(ctx, |tx| {
            let mut attr = load_attr(tx, ino)?;
            if attr.kind != FileKind::File {
                return Err(MetaError::NotPermitted);
            }
            let new_len = u64::from(indx) * u64::from(CHUNK_SIZE) + u64::from(slice.end());
            let mut space = 0;
            if new_len > attr.length {
                space = align4k(new_len) - align4k(attr.length);
                attr.length = new_len;
            }
            self.admit_quota(ctx, attr.uid, attr.gid, space, 0, attr.parent)?;
            attr.touch();
            let before = tx.get(&key)?.map(|v| v.len()).unwrap_or(0);
            tx.append(&key, &slice.encode())?;
            tx.set(&keys::inode(ino), &attr.encode()?);
            Ok((attr, space, before / SLICE_BYTES + 1))
        })?;
        self.update_usage(ctx, attr.parent, attr.uid, attr.gid, space, 0);
        let modulus = self.config.compact_write_modulus;
        if entries % modulus == modulus - 1 {
            debug!("chunk {}:{} has {} entries, asking for compaction", ino, indx, entries);
            self.request_compaction(ino, indx);
        }
        Ok(())
    }

    /// Visible content of a chunk. An empty result reads as zeros; a missing
    /// file is `NotFound`.
    pub fn read_chunk(&self, ctx: &Context, ino: Ino, indx: u32) -> Result<Vec<Slice>> {
        let log = self.txn.view(ctx, |tx| match tx.get(&keys::chunk(ino, indx))? {
            Some(buf) => Ok(decode_slices(&buf)),
            None => {
                load_attr(tx, ino)?;
                Ok(Vec::new())
            }
        })?;
        if log.len() >= self.config.compact_read_threshold {
            self.request_compaction(ino, indx);
        }
        Ok(build_slices(&log))
    }

    /// Raw log of a chunk, oldest entry first.
    pub fn chunk_log(&self, ctx: &Context, ino: Ino, indx: u32) -> Result<Vec<Slice>> {
        self.txn.view(ctx, |tx| {
            Ok(tx
                .get(&keys::chunk(ino, indx))?
                .map(|buf| decode_slices(&buf))
                .unwrap_or_default())
        })
    }

    /// Change the length of a file. Bytes between the old and the new length
    /// are covered with holes, so shrinking hides old data and growing reads
    /// as zeros.
    pub fn truncate(&self, ctx: &Context, ino: Ino, length: u64) -> Result<()> {
        let chunk = u64::from(CHUNK_SIZE);
        let outcome = self.txn.txn(ctx, |tx| {
            let mut attr = load_attr(tx, ino)?;
            if attr.kind != FileKind::File {
                return Err(MetaError::NotPermitted);
            }
            if attr.length == length {
                return Ok(None);
            }
            let space = align4k(length) - align4k(attr.length);
            self.admit_quota(ctx, attr.uid, attr.gid, space, 0, attr.parent)?;

            let (left, right) = if attr.length < length {
                (attr.length, length)
            } else {
                (length, attr.length)
            };
            let (first, last) = (left / chunk, right / chunk);
            if last - first > 1 {
                for (key, _) in tx.scan_prefix(&keys::chunk_prefix(ino))? {
                    if let Some((_, indx)) = keys::parse_chunk(&key) {
                        let indx = u64::from(indx);
                        if indx > first && indx < last {
                            tx.append(&key, &Slice::hole(0, CHUNK_SIZE).encode())?;
                        }
                    }
                }
            }
            let spills = right > (first + 1) * chunk;
            let l = if spills {
                CHUNK_SIZE - (left % chunk) as u32
            } else {
                (right - left) as u32
            };
            tx.append(
                &keys::chunk(ino, first as u32),
                &Slice::hole((left % chunk) as u32, l).encode(),
            )?;
            if spills && right % chunk > 0 {
                tx.append(
                    &keys::chunk(ino, last as u32),
                    &Slice::hole(0, (right % chunk) as u32).encode(),
                )?;
            }
            attr.length = length;
            attr.touch();
            tx.set(&keys::inode(ino), &attr.encode()?);
            Ok(Some((attr, space)))
        })?;
        if let Some((attr, space)) = outcome {
            self.update_usage(ctx, attr.parent, attr.uid, attr.gid, space, 0);
        }
        Ok(())
    }

    /// Fold part of a chunk log into one new object. With `force` the whole
    /// log is folded and the in-flight limit is ignored.
    pub fn compact_chunk(&self, ctx: &Context, ino: Ino, indx: u32, force: bool) -> Result<CompactOutcome> {
        {
            let mut compacting = self.compacting.lock();
            if compacting.contains(&(ino, indx))
                || (!force && compacting.len() >= self.config.max_compacting)
            {
                return Ok(CompactOutcome::Skipped);
            }
            compacting.insert((ino, indx));
        }
        let _guard = CompactGuard {
            meta: self,
            key: (ino, indx),
        };

        let log = self.chunk_log(ctx, ino, indx)?;
        if log.is_empty() {
            return Ok(CompactOutcome::Nothing);
        }
        let (head, tail) = if force { (0, log.len()) } else { skip_some(&log) };
        let plan = compact_window(&log, head, tail);
        if !plan.is_useful() {
            return Ok(CompactOutcome::Nothing);
        }

        let size = u32::try_from(plan.write)
            .map_err(|_| MetaError::Invalid(format!("compacted size {} of {}:{}", plan.write, ino, indx)))?;
        let new_id = self.new_slice_id(ctx)?;
        if size > 0 {
            if let Err(e) = self.store.merge(new_id, size, &plan.sources()) {
                warn!("compact {}:{}: merge into {} failed: {}", ino, indx, new_id, e);
                if let Err(e) = self.store.delete(new_id, size) {
                    debug!("remove partial object {}: {}", new_id, e);
                }
                return Err(e);
            }
        }

        let layout = plan.layout(new_id);
        let refs = layout.iter().filter(|s| !s.is_hole()).count() as i64;
        let key = keys::chunk(ino, indx);
        let swapped = self.txn.txn(ctx, |tx| {
            let cur = tx.get(&key)?.map(|b| decode_slices(&b)).unwrap_or_default();
            if !cur.starts_with(&log) {
                return Ok(None);
            }
            tx.set(&key, &encode_slices(&plan.apply(&cur, new_id)));
            if refs > 1 {
                tx.incr_by(&keys::slice_ref(new_id, size), refs - 1)?;
            }
            release_refs(tx, plan.dropped(&cur)).map(Some)
        });
        let dead = match swapped {
            Ok(Some(dead)) => dead,
            Ok(None) => {
                self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
                info!("compact {}:{}: log changed during compaction, discard object {}", ino, indx, new_id);
                if size > 0 {
                    self.delete_slice(ctx, new_id, size);
                }
                return Ok(CompactOutcome::Abandoned);
            }
            Err(e) => {
                warn!("compact {}:{}: {}", ino, indx, e);
                if size > 0 {
                    self.delete_slice(ctx, new_id, size);
                }
                return Err(e);
            }
        };

        self.stats.compactions.fetch_add(1, Ordering::Relaxed);
        debug!(
            "compacted {}:{} entries {}..{} into {} (write {}, delete {}, {} slices freed)",
            ino,
            indx,
            head,
            tail,
            new_id,
            plan.write,
            plan.delete,
            dead.len()
        );
        for (id, size) in dead {
            self.delete_slice(ctx, id, size);
        }
        Ok(CompactOutcome::Compacted {
            head,
            tail,
            new_id,
            write: plan.write,
            delete: plan.delete,
        })
    }

    /// Compact every chunk holding more than one entry. Returns how many
    /// chunks changed.
    pub fn compact_all(&self, ctx: &Context) -> Result<usize> {
        let chunks = self.txn.view(ctx, |tx| {
            let mut out = Vec::new();
            for (key, value) in tx.scan_prefix(b"A")? {
                if let Some(chunk) = keys::parse_chunk(&key) {
                    if value.len() > SLICE_BYTES {
                        out.push(chunk);
                    }
                }
            }
            Ok(out)
        })?;
        let mut done = 0;
        for (ino, indx) in chunks {
            ctx.check()?;
            match self.compact_chunk(ctx, ino, indx, false) {
                Ok(CompactOutcome::Compacted { .. }) => done += 1,
                Ok(_) => {}
                Err(e) => warn!("compact {}:{}: {}", ino, indx, e),
            }
        }
        info!("compacted {} chunks", done);
        Ok(done)
    }

    /// Remove an object nobody references, then its reference counter.
    /// Failures are logged; the reference key stays for a later attempt.
    pub(super) fn delete_slice(&self, ctx: &Context, id: u64, size: u32) {
        if let Err(e) = self.store.delete(id, size) {
            warn!("delete slice {} ({} bytes): {}", id, size, e);
            return;
        }
        let res = self.txn.txn(ctx, |tx| {
            tx.delete(&keys::slice_ref(id, size));
            Ok(())
        });
        match res {
            Ok(()) => {
                self.stats.slices_deleted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("remove reference of slice {}: {}", id, e),
        }
    }

    /// Drop a whole chunk log and the references it held.
    pub fn delete_chunk(&self, ctx: &Context, ino: Ino, indx: u32) -> Result<()> {
        let key = keys::chunk(ino, indx);
        let dead = self.txn.txn(ctx, |tx| {
            let log = match tx.get(&key)? {
                Some(buf) => decode_slices(&buf),
                None => return Ok(Vec::new()),
            };
            tx.delete(&key);
            release_refs(tx, log.iter())
        })?;
        for (id, size) in dead {
            self.delete_slice(ctx, id, size);
        }
        Ok(())
    }

    fn delete_file_data(&self, ctx: &Context, ino: Ino, length: u64) -> Result<()> {
        let chunks = self.txn.view(ctx, |tx| {
            Ok(tx
                .scan_prefix(&keys::chunk_prefix(ino))?
                .into_iter()
                .filter_map(|(k, _)| keys::parse_chunk(&k))
                .collect::<Vec<_>>())
        })?;
        for (_, indx) in chunks {
            ctx.check()?;
            self.delete_chunk(ctx, ino, indx)?;
        }
        self.txn.txn(ctx, |tx| {
            tx.delete(&keys::delfile(ino, length));
            Ok(())
        })
    }

    /// Release the data of every unlinked file. Returns how many files were
    /// cleaned.
    pub fn cleanup_deleted_files(&self, ctx: &Context) -> Result<usize> {
        let files = self.txn.view(ctx, |tx| {
            Ok(tx
                .scan_prefix(b"D")?
                .into_iter()
                .filter_map(|(k, _)| keys::parse_delfile(&k))
                .collect::<Vec<_>>())
        })?;
        let mut cleaned = 0;
        for (ino, length) in files {
            ctx.check()?;
            match self.delete_file_data(ctx, ino, length) {
                Ok(()) => {
                    cleaned += 1;
                    self.stats.files_cleaned.fetch_add(1, Ordering::Relaxed);
                }
                Err(MetaError::Cancelled) => return Err(MetaError::Cancelled),
                Err(e) => warn!("delete data of file {}: {}", ino, e),
            }
        }
        if cleaned > 0 {
            info!("Cleaned up {} deleted files", cleaned);
        }
        Ok(cleaned)
    }
}
