use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::{MetaError, Result};
use crate::slice::compact::Source;

/// The data layer under the metadata engine. Only the two operations the
/// compactor and the garbage collector need are exposed.
pub trait ObjectStore: Send + Sync {
    /// Build object `id` of `size` bytes by concatenating `sources`.
    fn merge(&self, id: u64, size: u32, sources: &[Source]) -> Result<()>;

    /// Remove the object; called once nothing references it.
    fn delete(&self, id: u64, size: u32) -> Result<()>;
}

/// Accepts everything and stores nothing.
#[derive(Debug, Default)]
pub struct NullObjectStore;

impl ObjectStore for NullObjectStore {
    fn merge(&self, _id: u64, _size: u32, _sources: &[Source]) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _id: u64, _size: u32) -> Result<()> {
        Ok(())
    }
}

/// Keeps track of merges and deletions so callers can audit them.
#[derive(Debug, Default)]
pub struct MemObjectStore {
    merged: Mutex<HashMap<u64, (u32, Vec<Source>)>>,
    deleted: Mutex<HashSet<(u64, u32)>>,
    failing_merges: AtomicU32,
}

impl MemObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` merges fail.
    pub fn fail_merges(&self, n: u32) {
        self.failing_merges.store(n, Ordering::SeqCst);
    }

    pub fn sources(&self, id: u64) -> Option<Vec<Source>> {
        self.merged.lock().get(&id).map(|(_, s)| s.clone())
    }

    pub fn merged_count(&self) -> usize {
        self.merged.lock().len()
    }

    pub fn is_deleted(&self, id: u64, size: u32) -> bool {
        self.deleted.lock().contains(&(id, size))
    }

    pub fn deleted(&self) -> Vec<(u64, u32)> {
        let mut out: Vec<_> = self.deleted.lock().iter().copied().collect();
        out.sort_unstable();
        out
    }

    /// Follow merged objects back to the original object and offset.
    pub fn origin(&self, id: u64, off: u32) -> (u64, u32) {
        let merged = self.merged.lock();
        let (mut id, mut off) = (id, off);
        while let Some((_, sources)) = merged.get(&id) {
            let mut cursor = 0;
            let mut next = None;
            for s in sources {
                if off < cursor + s.len {
                    next = Some((s.id, s.off + off - cursor));
                    break;
                }
                cursor += s.len;
            }
            match next {
                Some((i, o)) => {
                    id = i;
                    off = o;
                }
                None => break,
            }
        }
        (id, off)
    }
}

impl ObjectStore for MemObjectStore {
    fn merge(&self, id: u64, size: u32, sources: &[Source]) -> Result<()> {
        let failing = self
            .failing_merges
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MetaError::Backend {
                message: format!("merge into object {id} failed"),
                retryable: false,
            });
        }
        let deleted = self.deleted.lock();
        if let Some(gone) = sources.iter().find(|s| deleted.contains(&(s.id, s.size))) {
            return Err(MetaError::NotFound(format!("object {} ({} bytes)", gone.id, gone.size)));
        }
        drop(deleted);
        self.merged.lock().insert(id, (size, sources.to_vec()));
        Ok(())
    }

    fn delete(&self, id: u64, size: u32) -> Result<()> {
        self.deleted.lock().insert((id, size));
        Ok(())
    }
}
