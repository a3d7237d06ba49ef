//! Byte-range (POSIX) and whole-file (BSD) lock records.

pub mod flock;
pub mod ledger;

use crate::error::{MetaError, Result};

pub use flock::{decode_flocks, encode_flocks, FlockMap, FlockType, LockOwner};
pub use ledger::{conflicting, query, update_locks};

pub const LOCK_BYTES: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    Read,
    Write,
    Unlocked,
}

impl LockType {
    pub fn code(self) -> u32 {
        match self {
            LockType::Read => 0,
            LockType::Write => 1,
            LockType::Unlocked => 2,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(LockType::Read),
            1 => Ok(LockType::Write),
            2 => Ok(LockType::Unlocked),
            other => Err(MetaError::Invalid(format!("lock type {other}"))),
        }
    }
}

/// One locked range; `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeLock {
    pub ltype: LockType,
    pub owner: u32,
    pub start: u64,
    pub end: u64,
}

impl RangeLock {
    pub fn new(ltype: LockType, owner: u32, start: u64, end: u64) -> Self {
        Self {
            ltype,
            owner,
            start,
            end,
        }
    }

    pub fn unlocked() -> Self {
        Self::new(LockType::Unlocked, 0, 0, 0)
    }

    pub fn intersects(&self, start: u64, end: u64) -> bool {
        end >= self.start && start <= self.end
    }
}

/// Decode a ledger. Unlike chunk logs, a partial record fails the read.
pub fn decode_locks(buf: &[u8]) -> Result<Vec<RangeLock>> {
    if buf.len() % LOCK_BYTES != 0 {
        return Err(MetaError::Corrupt {
            what: "lock ledger",
            len: buf.len(),
        });
    }
    buf.chunks_exact(LOCK_BYTES)
        .map(|rec| {
            let mut w = [0u8; 4];
            let mut d = [0u8; 8];
            w.copy_from_slice(&rec[0..4]);
            let ltype = LockType::from_code(u32::from_be_bytes(w))?;
            w.copy_from_slice(&rec[4..8]);
            let owner = u32::from_be_bytes(w);
            d.copy_from_slice(&rec[8..16]);
            let start = u64::from_be_bytes(d);
            d.copy_from_slice(&rec[16..24]);
            let end = u64::from_be_bytes(d);
            Ok(RangeLock::new(ltype, owner, start, end))
        })
        .collect()
}

pub fn encode_locks(ls: &[RangeLock]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ls.len() * LOCK_BYTES);
    for l in ls {
        buf.extend_from_slice(&l.ltype.code().to_be_bytes());
        buf.extend_from_slice(&l.owner.to_be_bytes());
        buf.extend_from_slice(&l.start.to_be_bytes());
        buf.extend_from_slice(&l.end.to_be_bytes());
    }
    buf
}
