//! The metadata engine.
//!
//! `Meta` ties the pieces together over one [`KvClient`]: namespace
//! primitives, chunk logs with their compaction and slice garbage collection,
//! byte-range and whole-file locks, and the quota ledger with its periodic
//! flush. Every durable change goes through [`TxnRunner`]; in-memory state is
//! limited to caches and counters that are safe to lose.

pub mod attr;
mod background;
mod chunk;
mod locks;
mod namespace;
pub mod object;
mod quota_admin;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::MetaConfig;
use crate::context::Context;
use crate::error::{MetaError, Result};
use crate::kv::{keys, KvClient, TxnRunner};
use crate::quota::{QuotaKind, QuotaLedger, QuotaSnapshot};

pub use attr::{align4k, Attr, FileKind};
pub use background::BackgroundWorkers;
pub use chunk::CompactOutcome;
pub use locks::{LockInfo, LockTypeName};
pub use namespace::{Entry, Summary};
pub use object::{MemObjectStore, NullObjectStore, ObjectStore};
pub use quota_admin::QuotaCheck;

pub type Ino = u64;

pub const ROOT_INODE: Ino = 1;

#[derive(Debug, Default)]
struct Stats {
    compactions: AtomicU64,
    abandoned: AtomicU64,
    slices_deleted: AtomicU64,
    files_cleaned: AtomicU64,
}

pub struct Meta {
    config: MetaConfig,
    txn: TxnRunner,
    store: Arc<dyn ObjectStore>,
    quotas: QuotaLedger,
    /// Parent of every directory seen so far; directories never move here.
    dir_parents: DashMap<Ino, Ino>,
    compacting: Mutex<HashSet<(Ino, u32)>>,
    compact_queue: Mutex<Option<mpsc::Sender<(Ino, u32)>>>,
    last_flush: Mutex<Option<DateTime<Utc>>>,
    stats: Stats,
}

/// Quota line of a status report.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub kind: QuotaKind,
    pub key: u64,
    #[serde(flatten)]
    pub usage: QuotaSnapshot,
}

/// Point-in-time report of the engine, written out as JSON by the binary.
#[derive(Debug, Clone, Serialize)]
pub struct MetaStatus {
    pub backend: String,
    pub session_id: u64,
    pub read_only: bool,
    pub txn_restarts: u64,
    pub compacting: usize,
    pub compactions: u64,
    pub abandoned_compactions: u64,
    pub slices_deleted: u64,
    pub files_cleaned: u64,
    pub used_space: i64,
    pub used_inodes: i64,
    pub pending_quota_space: i64,
    pub pending_quota_inodes: i64,
    pub quotas: Vec<QuotaStatus>,
    pub last_quota_flush: Option<String>,
    pub generated_at: String,
}

impl Meta {
    pub fn new(client: Arc<dyn KvClient>, store: Arc<dyn ObjectStore>, config: MetaConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "Metadata engine on {} (session {}, read_only={})",
            client.name(),
            config.session_id,
            config.read_only
        );
        Ok(Self {
            txn: TxnRunner::new(client, &config),
            quotas: QuotaLedger::new(config.capacity, config.max_inodes),
            config,
            store,
            dir_parents: DashMap::new(),
            compacting: Mutex::new(HashSet::new()),
            compact_queue: Mutex::new(None),
            last_flush: Mutex::new(None),
            stats: Stats::default(),
        })
    }

    pub fn config(&self) -> &MetaConfig {
        &self.config
    }

    pub fn quotas(&self) -> &QuotaLedger {
        &self.quotas
    }

    /// Create the root directory if the volume is new, then load quotas and
    /// volume counters.
    pub fn init(&self, ctx: &Context) -> Result<()> {
        if !self.config.read_only {
            let created = self.txn.txn(ctx, |tx| {
                if tx.get(&keys::inode(ROOT_INODE))?.is_some() {
                    return Ok(false);
                }
                let root = Attr::new(FileKind::Directory, 0o777, 0, 0, ROOT_INODE);
                tx.set(&keys::inode(ROOT_INODE), &root.encode()?);
                if tx.incr_by(&keys::counter(keys::NEXT_INODE), 0)? < ROOT_INODE as i64 {
                    tx.set(
                        &keys::counter(keys::NEXT_INODE),
                        &(ROOT_INODE as i64).to_le_bytes(),
                    );
                }
                Ok(true)
            })?;
            if created {
                info!("Created root directory");
            }
        }
        self.load_quotas(ctx)?;
        Ok(())
    }

    /// Parent of directory `ino`, from the cache or storage.
    pub fn dir_parent(&self, ctx: &Context, ino: Ino) -> Result<Ino> {
        if ino == ROOT_INODE {
            return Ok(ROOT_INODE);
        }
        if let Some(p) = self.dir_parents.get(&ino) {
            return Ok(*p);
        }
        let attr = self.get_attr(ctx, ino)?;
        if !attr.is_dir() {
            return Err(MetaError::Invalid(format!("inode {ino} is not a directory")));
        }
        self.dir_parents.insert(ino, attr.parent);
        Ok(attr.parent)
    }

    /// Admission check for a change of `space` bytes and `inodes` inodes
    /// under directory `parent`, owned by `uid:gid`.
    fn admit_quota(&self, ctx: &Context, uid: u32, gid: u32, space: i64, inodes: i64, parent: Ino) -> Result<()> {
        self.quotas
            .check(uid, gid, space, inodes, &[parent], |ino| self.dir_parent(ctx, ino))
    }

    /// Account a committed change in every ledger it belongs to.
    fn update_usage(&self, ctx: &Context, parent: Ino, uid: u32, gid: u32, space: i64, inodes: i64) {
        if space == 0 && inodes == 0 {
            return;
        }
        self.quotas.update_volume(space, inodes);
        self.quotas
            .update_dir(parent, space, inodes, |ino| self.dir_parent(ctx, ino));
        self.quotas.update_owner(uid, gid, space, inodes);
    }

    /// Queue a chunk for the compaction worker; dropped when none runs.
    fn request_compaction(&self, ino: Ino, indx: u32) {
        match self.compact_queue.lock().as_ref() {
            Some(tx) => {
                if tx.send((ino, indx)).is_err() {
                    debug!("compaction worker gone, dropping request for {}:{}", ino, indx);
                }
            }
            None => debug!("no compaction worker, skip {}:{}", ino, indx),
        }
    }

    pub fn status(&self) -> MetaStatus {
        let (used_space, used_inodes) = self.quotas.volume_usage();
        let (pending_space, pending_inodes) = self.quotas.pending_totals();
        let mut quotas = Vec::new();
        for kind in [QuotaKind::Dir, QuotaKind::User, QuotaKind::Group] {
            for (key, usage) in self.quotas.snapshots(kind) {
                quotas.push(QuotaStatus { kind, key, usage });
            }
        }
        MetaStatus {
            backend: self.txn.client_name().to_string(),
            session_id: self.config.session_id,
            read_only: self.config.read_only,
            txn_restarts: self.txn.restarts(),
            compacting: self.compacting.lock().len(),
            compactions: self.stats.compactions.load(Ordering::Relaxed),
            abandoned_compactions: self.stats.abandoned.load(Ordering::Relaxed),
            slices_deleted: self.stats.slices_deleted.load(Ordering::Relaxed),
            files_cleaned: self.stats.files_cleaned.load(Ordering::Relaxed),
            used_space,
            used_inodes,
            pending_quota_space: pending_space,
            pending_quota_inodes: pending_inodes,
            quotas,
            last_quota_flush: self.last_flush.lock().map(|t| t.to_rfc3339()),
            generated_at: Utc::now().to_rfc3339(),
        }
    }
}
