use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::attr::align4k;
use super::{Ino, Meta, ROOT_INODE};
use crate::context::Context;
use crate::error::{MetaError, Result};
use crate::kv::{keys, parse_counter, KvTxn};
use crate::quota::{QuotaKind, QuotaRecord};

/// Outcome of comparing a stored quota with a fresh usage scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaCheck {
    pub kind: QuotaKind,
    pub key: u64,
    pub stored_space: i64,
    pub stored_inodes: i64,
    pub actual_space: i64,
    pub actual_inodes: i64,
    pub repaired: bool,
}

impl QuotaCheck {
    pub fn is_consistent(&self) -> bool {
        self.stored_space == self.actual_space && self.stored_inodes == self.actual_inodes
    }
}

fn load_kind(tx: &mut dyn KvTxn, kind: QuotaKind) -> Result<HashMap<u64, QuotaRecord>> {
    let mut out = HashMap::new();
    for (key, value) in tx.scan_prefix(keys::quota_prefix(kind))? {
        if let Some(id) = keys::parse_quota(&key) {
            out.insert(id, QuotaRecord::decode(&value)?);
        }
    }
    Ok(out)
}

fn read_counter(tx: &mut dyn KvTxn, name: &str) -> Result<i64> {
    match tx.get(&keys::counter(name))? {
        Some(buf) => parse_counter(&buf),
        None => Ok(0),
    }
}

impl Meta {
    /// Current usage of whatever a quota of `kind` on `key` would cover.
    fn measure(&self, ctx: &Context, kind: QuotaKind, key: u64) -> Result<(i64, i64)> {
        match kind {
            QuotaKind::Dir => {
                let sum = self.quota_summary(ctx, key as Ino)?;
                // the directory itself is charged to its parent
                Ok((sum.size - align4k(0), sum.dirs + sum.files - 1))
            }
            QuotaKind::User => self.owner_usage(ctx, Some(key as u32), None),
            QuotaKind::Group => self.owner_usage(ctx, None, Some(key as u32)),
        }
    }

    /// Set the limits of a quota, creating it when missing. A new quota starts
    /// from the usage currently found under it. Returns whether it was created.
    pub fn set_quota(&self, ctx: &Context, kind: QuotaKind, key: u64, max_space: i64, max_inodes: i64) -> Result<bool> {
        if kind == QuotaKind::Dir && !self.get_attr(ctx, key)?.is_dir() {
            return Err(MetaError::Invalid(format!("inode {key} is not a directory")));
        }
        let qkey = keys::quota(kind, key);
        let exists = self.txn.view(ctx, |tx| Ok(tx.get(&qkey)?.is_some()))?;
        let usage = if exists { None } else { Some(self.measure(ctx, kind, key)?) };
        let (record, created) = self.txn.txn(ctx, |tx| {
            let (mut record, created) = match tx.get(&qkey)? {
                Some(buf) => (QuotaRecord::decode(&buf)?, false),
                None => {
                    let (used_space, used_inodes) = usage.unwrap_or_default();
                    let record = QuotaRecord {
                        used_space,
                        used_inodes,
                        ..QuotaRecord::default()
                    };
                    (record, true)
                }
            };
            record.max_space = max_space;
            record.max_inodes = max_inodes;
            tx.set(&qkey, &record.encode());
            Ok((record, created))
        })?;
        self.quotas.insert(kind, key, record);
        if created && kind == QuotaKind::Dir {
            self.shift_to_ancestor(ctx, key, -record.used_space, -record.used_inodes)?;
        }
        info!(
            "Set {:?} quota {}: space {} / {}, inodes {} / {}",
            kind, key, record.used_space, max_space, record.used_inodes, max_inodes
        );
        Ok(created)
    }

    pub fn get_quota(&self, ctx: &Context, kind: QuotaKind, key: u64) -> Result<QuotaRecord> {
        self.txn.view(ctx, |tx| match tx.get(&keys::quota(kind, key))? {
            Some(buf) => QuotaRecord::decode(&buf),
            None => Err(MetaError::NotFound(format!("{kind:?} quota {key}"))),
        })
    }

    pub fn del_quota(&self, ctx: &Context, kind: QuotaKind, key: u64) -> Result<()> {
        let qkey = keys::quota(kind, key);
        self.txn.txn(ctx, |tx| {
            if tx.get(&qkey)?.is_none() {
                return Err(MetaError::NotFound(format!("{kind:?} quota {key}")));
            }
            tx.delete(&qkey);
            Ok(())
        })?;
        if let Some(q) = self.quotas.remove(kind, key) {
            if kind == QuotaKind::Dir {
                let s = q.snapshot();
                self.shift_to_ancestor(
                    ctx,
                    key,
                    s.used_space + s.pending_space,
                    s.used_inodes + s.pending_inodes,
                )?;
            }
        }
        info!("Deleted {:?} quota {}", kind, key);
        Ok(())
    }

    /// Move usage between the quota of `dir` and the nearest dir quota above
    /// it, keeping every byte charged to exactly one dir quota.
    fn shift_to_ancestor(&self, ctx: &Context, dir: Ino, space: i64, inodes: i64) -> Result<()> {
        if dir == ROOT_INODE || (space == 0 && inodes == 0) {
            return Ok(());
        }
        let parent = self.dir_parent(ctx, dir)?;
        if let Some((above, q)) = self.quotas.nearest_dir(parent, |ino| self.dir_parent(ctx, ino)) {
            q.update(space, inodes);
            debug!("moved ({}, {}) of dir {} to the quota of {}", space, inodes, dir, above);
        }
        Ok(())
    }

    pub fn list_quotas(&self, ctx: &Context) -> Result<Vec<(QuotaKind, u64, QuotaRecord)>> {
        self.txn.view(ctx, |tx| {
            let mut out = Vec::new();
            for kind in [QuotaKind::Dir, QuotaKind::User, QuotaKind::Group] {
                let mut records: Vec<_> = load_kind(tx, kind)?.into_iter().collect();
                records.sort_by_key(|(k, _)| *k);
                out.extend(records.into_iter().map(|(k, r)| (kind, k, r)));
            }
            Ok(out)
        })
    }

    /// Refresh cached quotas and volume usage from storage.
    pub fn load_quotas(&self, ctx: &Context) -> Result<()> {
        let (loaded, used_space, used_inodes) = self.txn.view(ctx, |tx| {
            let mut loaded = Vec::new();
            for kind in [QuotaKind::Dir, QuotaKind::User, QuotaKind::Group] {
                loaded.push((kind, load_kind(tx, kind)?));
            }
            Ok((
                loaded,
                read_counter(tx, keys::USED_SPACE)?,
                read_counter(tx, keys::TOTAL_INODES)?,
            ))
        })?;
        for (kind, records) in loaded {
            self.quotas.reconcile(kind, records);
        }
        self.quotas.set_volume_usage(used_space, used_inodes);
        Ok(())
    }

    /// Persist pending quota and volume deltas. Returns how many quotas
    /// were written.
    pub fn flush_quotas(&self, ctx: &Context) -> Result<usize> {
        let written = self.quotas.flush(|deltas| {
            self.txn.txn(ctx, |tx| {
                for d in deltas {
                    let key = keys::quota(d.kind, d.key);
                    match tx.get(&key)? {
                        Some(buf) => {
                            let mut record = QuotaRecord::decode(&buf)?;
                            record.used_space += d.space;
                            record.used_inodes += d.inodes;
                            tx.set(&key, &record.encode());
                        }
                        None => debug!("{:?} quota {} vanished before flush", d.kind, d.key),
                    }
                }
                Ok(())
            })
        })?;
        self.quotas.flush_volume(|space, inodes| {
            self.txn.txn(ctx, |tx| {
                tx.incr_by(&keys::counter(keys::USED_SPACE), space)?;
                tx.incr_by(&keys::counter(keys::TOTAL_INODES), inodes)?;
                Ok(())
            })
        })?;
        *self.last_flush.lock() = Some(Utc::now());
        if written > 0 {
            debug!("Flushed {} quotas", written);
        }
        Ok(written)
    }

    /// Compare a quota's stored usage with a fresh scan and, with `repair`,
    /// overwrite the stored usage with what was found.
    pub fn check_quota(&self, ctx: &Context, kind: QuotaKind, key: u64, repair: bool) -> Result<QuotaCheck> {
        self.flush_quotas(ctx)?;
        let stored = self.get_quota(ctx, kind, key)?;
        let (actual_space, actual_inodes) = self.measure(ctx, kind, key)?;
        let mut check = QuotaCheck {
            kind,
            key,
            stored_space: stored.used_space,
            stored_inodes: stored.used_inodes,
            actual_space,
            actual_inodes,
            repaired: false,
        };
        if check.is_consistent() {
            return Ok(check);
        }
        warn!(
            "{:?} quota {} is inconsistent: stored ({}, {}), actual ({}, {})",
            kind, key, stored.used_space, stored.used_inodes, actual_space, actual_inodes
        );
        if !repair {
            return Ok(check);
        }
        let qkey = keys::quota(kind, key);
        let record = self.txn.txn(ctx, |tx| {
            let buf = tx
                .get(&qkey)?
                .ok_or_else(|| MetaError::NotFound(format!("{kind:?} quota {key}")))?;
            let mut record = QuotaRecord::decode(&buf)?;
            record.used_space = actual_space;
            record.used_inodes = actual_inodes;
            tx.set(&qkey, &record.encode());
            Ok(record)
        })?;
        self.quotas.insert(kind, key, record);
        check.repaired = true;
        info!("Repaired {:?} quota {}", kind, key);
        Ok(check)
    }
}
