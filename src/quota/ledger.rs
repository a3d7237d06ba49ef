use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{Quota, QuotaKind, QuotaRecord, QuotaSnapshot};
use crate::error::{MetaError, Result};
use crate::meta::{Ino, ROOT_INODE};

/// A pending delta taken out of one quota for flushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDelta {
    pub kind: QuotaKind,
    pub key: u64,
    pub space: i64,
    pub inodes: i64,
}

/// Volume-wide usage and limits.
#[derive(Debug, Default)]
struct Volume {
    capacity: AtomicI64,
    max_inodes: AtomicI64,
    used_space: AtomicI64,
    used_inodes: AtomicI64,
    pending_space: AtomicI64,
    pending_inodes: AtomicI64,
}

type QuotaMap = RwLock<HashMap<u64, Arc<Quota>>>;

/// Every quota the engine enforces, keyed by kind and inode/uid/gid.
#[derive(Debug, Default)]
pub struct QuotaLedger {
    dirs: QuotaMap,
    users: QuotaMap,
    groups: QuotaMap,
    volume: Volume,
}

impl QuotaLedger {
    pub fn new(capacity: u64, max_inodes: u64) -> Self {
        let ledger = Self::default();
        ledger.volume.capacity.store(capacity as i64, Ordering::Release);
        ledger.volume.max_inodes.store(max_inodes as i64, Ordering::Release);
        ledger
    }

    fn map(&self, kind: QuotaKind) -> &QuotaMap {
        match kind {
            QuotaKind::Dir => &self.dirs,
            QuotaKind::User => &self.users,
            QuotaKind::Group => &self.groups,
        }
    }

    pub fn get(&self, kind: QuotaKind, key: u64) -> Option<Arc<Quota>> {
        self.map(kind).read().get(&key).cloned()
    }

    /// Install or refresh a quota from its stored record.
    pub fn insert(&self, kind: QuotaKind, key: u64, record: QuotaRecord) -> Arc<Quota> {
        let mut map = self.map(kind).write();
        match map.get(&key) {
            Some(q) => {
                q.replace(record);
                q.clone()
            }
            None => {
                let q = Arc::new(Quota::new(record));
                map.insert(key, q.clone());
                q
            }
        }
    }

    pub fn remove(&self, kind: QuotaKind, key: u64) -> Option<Arc<Quota>> {
        self.map(kind).write().remove(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.read().is_empty() && self.users.read().is_empty() && self.groups.read().is_empty()
    }

    /// Reconcile the cached quotas of one kind with what storage holds:
    /// vanished entries are dropped, new ones added, the rest refreshed.
    pub fn reconcile(&self, kind: QuotaKind, loaded: HashMap<u64, QuotaRecord>) {
        let mut map = self.map(kind).write();
        map.retain(|key, _| {
            let keep = loaded.contains_key(key);
            if !keep {
                info!("Quota for {:?} {} is deleted", kind, key);
            }
            keep
        });
        for (key, mut record) in loaded {
            record.sanitize();
            debug!("Load quota {:?} {} -> {:?}", kind, key, record);
            match map.get(&key) {
                Some(q) => q.replace(record),
                None => {
                    map.insert(key, Arc::new(Quota::new(record)));
                }
            }
        }
    }

    /// Nearest directory at or above `ino` carrying a quota.
    pub fn nearest_dir<F>(&self, mut ino: Ino, mut parent_of: F) -> Option<(Ino, Arc<Quota>)>
    where
        F: FnMut(Ino) -> Result<Ino>,
    {
        loop {
            if let Some(q) = self.get(QuotaKind::Dir, ino) {
                return Some((ino, q));
            }
            if ino <= ROOT_INODE {
                return None;
            }
            match parent_of(ino) {
                Ok(parent) => ino = parent,
                Err(e) => {
                    warn!("Get directory parent of inode {}: {}", ino, e);
                    return None;
                }
            }
        }
    }

    /// First directory on the path from `ino` to the root whose quota
    /// rejects the delta.
    pub fn check_dirs<F>(&self, mut ino: Ino, space: i64, inodes: i64, mut parent_of: F) -> Option<Ino>
    where
        F: FnMut(Ino) -> Result<Ino>,
    {
        if self.dirs.read().is_empty() {
            return None;
        }
        loop {
            if let Some(q) = self.get(QuotaKind::Dir, ino) {
                if q.check(space, inodes) {
                    return Some(ino);
                }
            }
            if ino <= ROOT_INODE {
                return None;
            }
            match parent_of(ino) {
                Ok(parent) => ino = parent,
                Err(e) => {
                    warn!("Get directory parent of inode {}: {}", ino, e);
                    return None;
                }
            }
        }
    }

    /// Account a delta under directory `ino` to its nearest quota only.
    pub fn update_dir<F>(&self, ino: Ino, space: i64, inodes: i64, parent_of: F)
    where
        F: FnMut(Ino) -> Result<Ino>,
    {
        if space == 0 && inodes == 0 {
            return;
        }
        if let Some((owner, q)) = self.nearest_dir(ino, parent_of) {
            debug!("dir quota {} += ({}, {}) via {}", owner, space, inodes, ino);
            q.update(space, inodes);
        }
    }

    pub fn update_owner(&self, uid: u32, gid: u32, space: i64, inodes: i64) {
        if let Some(q) = self.get(QuotaKind::User, u64::from(uid)) {
            q.update(space, inodes);
        }
        if let Some(q) = self.get(QuotaKind::Group, u64::from(gid)) {
            q.update(space, inodes);
        }
    }

    pub fn update_volume(&self, space: i64, inodes: i64) {
        self.volume.pending_space.fetch_add(space, Ordering::AcqRel);
        self.volume.pending_inodes.fetch_add(inodes, Ordering::AcqRel);
    }

    /// Admission check for a mutation under the directories `parents`.
    pub fn check<F>(
        &self,
        uid: u32,
        gid: u32,
        space: i64,
        inodes: i64,
        parents: &[Ino],
        mut parent_of: F,
    ) -> Result<()>
    where
        F: FnMut(Ino) -> Result<Ino>,
    {
        if space <= 0 && inodes <= 0 {
            return Ok(());
        }
        if let Some(q) = self.get(QuotaKind::User, u64::from(uid)) {
            if q.check(space, inodes) {
                return Err(MetaError::QuotaExceeded(format!("user {uid}")));
            }
        }
        if let Some(q) = self.get(QuotaKind::Group, u64::from(gid)) {
            if q.check(space, inodes) {
                return Err(MetaError::QuotaExceeded(format!("group {gid}")));
            }
        }
        let v = &self.volume;
        let capacity = v.capacity.load(Ordering::Acquire);
        if space > 0
            && capacity > 0
            && v.used_space.load(Ordering::Acquire) + v.pending_space.load(Ordering::Acquire) + space
                > capacity
        {
            return Err(MetaError::NoSpace);
        }
        let max_inodes = v.max_inodes.load(Ordering::Acquire);
        if inodes > 0
            && max_inodes > 0
            && v.used_inodes.load(Ordering::Acquire) + v.pending_inodes.load(Ordering::Acquire) + inodes
                > max_inodes
        {
            return Err(MetaError::NoSpace);
        }
        for &dir in parents {
            if let Some(ino) = self.check_dirs(dir, space, inodes, &mut parent_of) {
                return Err(MetaError::QuotaExceeded(format!("directory {ino}")));
            }
        }
        Ok(())
    }

    /// Zero every non-empty pending counter and return the deltas.
    pub fn take_pending(&self) -> Vec<PendingDelta> {
        let mut out = Vec::new();
        for kind in [QuotaKind::Dir, QuotaKind::User, QuotaKind::Group] {
            for (key, q) in self.map(kind).read().iter() {
                let (space, inodes) = q.take_pending();
                if space != 0 || inodes != 0 {
                    out.push(PendingDelta {
                        kind,
                        key: *key,
                        space,
                        inodes,
                    });
                }
            }
        }
        out
    }

    /// Apply `f` to the quota each delta came from, if it still exists.
    fn each_live(&self, deltas: &[PendingDelta], f: impl Fn(&Quota, &PendingDelta)) {
        for d in deltas {
            match self.get(d.kind, d.key) {
                Some(q) => f(&q, d),
                None => debug!("Quota {:?} {} removed during flush", d.kind, d.key),
            }
        }
    }

    /// Ship pending deltas through `persist`; on success they become part of
    /// `used`, on failure they go back to `pending`.
    pub fn flush<F>(&self, persist: F) -> Result<usize>
    where
        F: FnOnce(&[PendingDelta]) -> Result<()>,
    {
        let deltas = self.take_pending();
        if deltas.is_empty() {
            return Ok(0);
        }
        match persist(&deltas) {
            Ok(()) => {
                self.each_live(&deltas, |q, d| q.commit(d.space, d.inodes));
                Ok(deltas.len())
            }
            Err(e) => {
                self.each_live(&deltas, |q, d| q.restore(d.space, d.inodes));
                Err(e)
            }
        }
    }

    /// Volume counterpart of [`QuotaLedger::flush`].
    pub fn flush_volume<F>(&self, persist: F) -> Result<()>
    where
        F: FnOnce(i64, i64) -> Result<()>,
    {
        let v = &self.volume;
        let space = v.pending_space.swap(0, Ordering::AcqRel);
        let inodes = v.pending_inodes.swap(0, Ordering::AcqRel);
        if space == 0 && inodes == 0 {
            return Ok(());
        }
        match persist(space, inodes) {
            Ok(()) => {
                v.used_space.fetch_add(space, Ordering::AcqRel);
                v.used_inodes.fetch_add(inodes, Ordering::AcqRel);
                Ok(())
            }
            Err(e) => {
                self.update_volume(space, inodes);
                Err(e)
            }
        }
    }

    pub fn set_volume_usage(&self, used_space: i64, used_inodes: i64) {
        self.volume.used_space.store(used_space, Ordering::Release);
        self.volume.used_inodes.store(used_inodes, Ordering::Release);
    }

    /// Volume usage including deltas not yet flushed.
    pub fn volume_usage(&self) -> (i64, i64) {
        let v = &self.volume;
        (
            v.used_space.load(Ordering::Acquire) + v.pending_space.load(Ordering::Acquire),
            v.used_inodes.load(Ordering::Acquire) + v.pending_inodes.load(Ordering::Acquire),
        )
    }

    pub fn snapshots(&self, kind: QuotaKind) -> Vec<(u64, QuotaSnapshot)> {
        let mut out: Vec<_> = self
            .map(kind)
            .read()
            .iter()
            .map(|(k, q)| (*k, q.snapshot()))
            .collect();
        out.sort_by_key(|(k, _)| *k);
        out
    }

    /// Sum of pending deltas across all quotas.
    pub fn pending_totals(&self) -> (i64, i64) {
        let mut total = (0, 0);
        for kind in [QuotaKind::Dir, QuotaKind::User, QuotaKind::Group] {
            for (_, s) in self.snapshots(kind) {
                total.0 += s.pending_space;
                total.1 += s.pending_inodes;
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1 <- 5 <- 6 <- 7, plus 1 <- 2.
    fn parents(ino: Ino) -> Result<Ino> {
        match ino {
            5 | 2 => Ok(1),
            6 => Ok(5),
            7 => Ok(6),
            other => Err(MetaError::NotFound(format!("inode {other}"))),
        }
    }

    #[test]
    fn usage_goes_to_nearest_quota_only() {
        let ledger = QuotaLedger::default();
        ledger.insert(QuotaKind::Dir, 5, QuotaRecord::limits(1 << 20, 0));
        ledger.insert(QuotaKind::Dir, 1, QuotaRecord::limits(0, 0));

        ledger.update_dir(7, 10, 0, parents);
        let five = ledger.get(QuotaKind::Dir, 5).unwrap().snapshot();
        assert_eq!(five.pending_space, 10);
        assert_eq!(ledger.get(QuotaKind::Dir, 1).unwrap().snapshot().pending_space, 0);
        assert!(ledger.get(QuotaKind::Dir, 6).is_none());
    }

    #[test]
    fn every_ancestor_quota_is_checked() {
        let ledger = QuotaLedger::default();
        ledger.insert(QuotaKind::Dir, 6, QuotaRecord::limits(1000, 0));
        ledger.insert(
            QuotaKind::Dir,
            5,
            QuotaRecord {
                max_space: 500,
                used_space: 450,
                ..Default::default()
            },
        );
        assert_eq!(ledger.check_dirs(7, 100, 0, parents), Some(5));
        assert_eq!(ledger.check_dirs(7, 40, 0, parents), None);
        assert_eq!(ledger.check_dirs(2, 100, 0, parents), None);
        assert!(matches!(
            ledger.check(0, 0, 100, 0, &[7], parents),
            Err(MetaError::QuotaExceeded(_))
        ));
    }

    #[test]
    fn broken_parent_chain_stops_the_walk() {
        let ledger = QuotaLedger::default();
        ledger.insert(QuotaKind::Dir, 1, QuotaRecord::limits(1, 0));
        assert_eq!(ledger.check_dirs(42, 100, 0, parents), None);
    }

    #[test]
    fn volume_capacity_reports_no_space() {
        let ledger = QuotaLedger::new(4096, 0);
        ledger.update_volume(4096, 1);
        assert!(matches!(
            ledger.check(0, 0, 1, 0, &[], parents),
            Err(MetaError::NoSpace)
        ));
        assert!(ledger.check(0, 0, -4096, 0, &[], parents).is_ok());
    }

    #[test]
    fn user_and_group_quotas() {
        let ledger = QuotaLedger::default();
        ledger.insert(QuotaKind::User, 1000, QuotaRecord::limits(0, 2));
        ledger.update_owner(1000, 50, 0, 2);
        assert!(matches!(
            ledger.check(1000, 50, 0, 1, &[], parents),
            Err(MetaError::QuotaExceeded(_))
        ));
        assert!(ledger.check(1001, 50, 0, 1, &[], parents).is_ok());
    }

    #[test]
    fn failed_flush_keeps_deltas_pending() {
        let ledger = QuotaLedger::default();
        ledger.insert(QuotaKind::Dir, 5, QuotaRecord::default());
        ledger.update_dir(5, 300, 2, parents);

        let err = ledger.flush(|_| Err(MetaError::Conflict { key: "QD".into() }));
        assert!(err.is_err());
        let s = ledger.get(QuotaKind::Dir, 5).unwrap().snapshot();
        assert_eq!((s.used_space, s.pending_space), (0, 300));

        let mut shipped = Vec::new();
        let n = ledger
            .flush(|deltas| {
                shipped.extend_from_slice(deltas);
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(shipped[0].space, 300);
        let s = ledger.get(QuotaKind::Dir, 5).unwrap().snapshot();
        assert_eq!((s.used_space, s.used_inodes), (300, 2));
        assert_eq!((s.pending_space, s.pending_inodes), (0, 0));
    }

    #[test]
    fn reconcile_drops_vanished_and_sanitizes() {
        let ledger = QuotaLedger::default();
        ledger.insert(QuotaKind::Dir, 5, QuotaRecord::default());
        ledger.insert(QuotaKind::Dir, 6, QuotaRecord::default());
        let kept = ledger.get(QuotaKind::Dir, 6).unwrap();
        kept.update(7, 0);

        let mut loaded = HashMap::new();
        loaded.insert(
            6,
            QuotaRecord {
                max_space: 10,
                used_space: 20,
                ..Default::default()
            },
        );
        ledger.reconcile(QuotaKind::Dir, loaded);
        assert!(ledger.get(QuotaKind::Dir, 5).is_none());
        let s = ledger.get(QuotaKind::Dir, 6).unwrap().snapshot();
        assert_eq!((s.max_space, s.used_space, s.pending_space), (20, 20, 7));
    }
}
