//! BSD whole-file locks and POSIX byte-range locks, kept per inode.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use super::{Ino, Meta};
use crate::context::Context;
use crate::error::{MetaError, Result};
use crate::kv::keys;
use crate::lock::{
    conflicting, decode_flocks, decode_locks, encode_flocks, encode_locks, update_locks, FlockType, LockOwner, LockType,
    RangeLock,
};

/// A lock standing in the way of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub ltype: LockTypeName,
    pub start: u64,
    pub end: u64,
    /// Process id of the holder; only known for holders in this session.
    pub pid: u32,
    pub sid: u64,
    pub owner: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockTypeName {
    Read,
    Write,
}

impl LockTypeName {
    fn of(ltype: LockType) -> Self {
        match ltype {
            LockType::Write => LockTypeName::Write,
            _ => LockTypeName::Read,
        }
    }
}

fn retry_delay(write: bool) -> Duration {
    if write {
        Duration::from_millis(1)
    } else {
        Duration::from_millis(10)
    }
}

impl Meta {
    fn lock_owner(&self, owner: u64) -> LockOwner {
        LockOwner {
            sid: self.config.session_id,
            owner,
        }
    }

    /// Take, change or release (`None`) a whole-file lock. With `block` the
    /// call waits until the lock is free or `ctx` is cancelled.
    pub fn flock(&self, ctx: &Context, ino: Ino, owner: u64, ltype: Option<FlockType>, block: bool) -> Result<()> {
        let me = self.lock_owner(owner);
        let key = keys::flock(ino);
        loop {
            let res = self.txn.txn(ctx, |tx| {
                let mut ls = decode_flocks(&tx.get(&key)?.unwrap_or_default())?;
                match ltype {
                    None => {
                        ls.remove(&me);
                    }
                    Some(FlockType::Read) => {
                        if ls.iter().any(|(o, t)| *o != me && *t == FlockType::Write) {
                            return Err(MetaError::WouldBlock);
                        }
                        ls.insert(me, FlockType::Read);
                    }
                    Some(FlockType::Write) => {
                        if ls.keys().any(|o| *o != me) {
                            return Err(MetaError::WouldBlock);
                        }
                        ls.insert(me, FlockType::Write);
                    }
                }
                if ls.is_empty() {
                    tx.delete(&key);
                } else {
                    tx.set(&key, &encode_flocks(&ls));
                }
                Ok(())
            });
            match res {
                Err(MetaError::WouldBlock) if block => {
                    ctx.check()?;
                    std::thread::sleep(retry_delay(ltype == Some(FlockType::Write)));
                }
                other => return other,
            }
        }
    }

    /// First lock held by another owner that conflicts with the range.
    pub fn getlk(
        &self,
        ctx: &Context,
        ino: Ino,
        owner: u64,
        ltype: LockType,
        start: u64,
        end: u64,
    ) -> Result<Option<LockInfo>> {
        if ltype == LockType::Unlocked {
            return Ok(None);
        }
        let me = self.lock_owner(owner);
        self.txn.view(ctx, |tx| {
            for (key, value) in tx.scan_prefix(&keys::plock_prefix(ino))? {
                let Some((sid, o)) = keys::parse_plock(&key) else {
                    continue;
                };
                if sid == me.sid && o == me.owner {
                    continue;
                }
                let ls = decode_locks(&value)?;
                if let Some(l) = conflicting(&ls, ltype, start, end) {
                    return Ok(Some(LockInfo {
                        ltype: LockTypeName::of(l.ltype),
                        start: l.start,
                        end: l.end,
                        pid: if sid == me.sid { l.owner } else { 0 },
                        sid,
                        owner: o,
                    }));
                }
            }
            Ok(None)
        })
    }

    /// Lock or unlock `[start, end]` for one owner. `pid` is recorded with
    /// the range and reported back by [`Meta::getlk`].
    #[allow(clippy::too_many_arguments)]
    pub fn setlk(
        &self,
        ctx: &Context,
        ino: Ino,
        owner: u64,
        block: bool,
        ltype: LockType,
        start: u64,
        end: u64,
        pid: u32,
    ) -> Result<()> {
        if start > end {
            return Err(MetaError::Invalid(format!("lock range {start}..={end}")));
        }
        let me = self.lock_owner(owner);
        let mine = keys::plock(ino, me.sid, me.owner);
        let request = RangeLock::new(ltype, pid, start, end);
        loop {
            let res = self.txn.txn(ctx, |tx| {
                let held = if ltype == LockType::Unlocked {
                    match tx.get(&mine)? {
                        Some(buf) => decode_locks(&buf)?,
                        None => return Ok(()),
                    }
                } else {
                    let mut held = Vec::new();
                    for (key, value) in tx.scan_prefix(&keys::plock_prefix(ino))? {
                        let ls = decode_locks(&value)?;
                        if key == mine {
                            held = ls;
                        } else if conflicting(&ls, ltype, start, end).is_some() {
                            return Err(MetaError::WouldBlock);
                        }
                    }
                    held
                };
                let ls = update_locks(held, request);
                if ls.is_empty() {
                    tx.delete(&mine);
                } else {
                    tx.set(&mine, &encode_locks(&ls));
                }
                Ok(())
            });
            match res {
                Err(MetaError::WouldBlock) if block => {
                    ctx.check()?;
                    std::thread::sleep(retry_delay(ltype == LockType::Write));
                }
                Err(e) => {
                    debug!("setlk {} [{}, {}] for {:?}: {}", ino, start, end, me, e);
                    return Err(e);
                }
                Ok(()) => return Ok(()),
            }
        }
    }

    pub fn list_flocks(&self, ctx: &Context, ino: Ino) -> Result<Vec<(LockOwner, FlockType)>> {
        let ls = self
            .txn
            .view(ctx, |tx| decode_flocks(&tx.get(&keys::flock(ino))?.unwrap_or_default()))?;
        let mut out: Vec<_> = ls.into_iter().collect();
        out.sort_by_key(|(o, _)| *o);
        Ok(out)
    }

    pub fn list_plocks(&self, ctx: &Context, ino: Ino) -> Result<Vec<(LockOwner, Vec<RangeLock>)>> {
        self.txn.view(ctx, |tx| {
            let mut out = Vec::new();
            for (key, value) in tx.scan_prefix(&keys::plock_prefix(ino))? {
                if let Some((sid, owner)) = keys::parse_plock(&key) {
                    out.push((LockOwner { sid, owner }, decode_locks(&value)?));
                }
            }
            Ok(out)
        })
    }
}
