//! Space and inode quotas.
//!
//! Hot paths only touch atomics: admission checks read `used + pending`,
//! accounting adds to `pending`. A periodic flush moves `pending` into the
//! durable record and then into `used`.

pub mod ledger;

use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

use crate::error::{MetaError, Result};

pub use ledger::{PendingDelta, QuotaLedger};

pub const QUOTA_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaKind {
    Dir,
    User,
    Group,
}

/// Durable form of a quota: limits and the last flushed usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QuotaRecord {
    pub max_space: i64,
    pub max_inodes: i64,
    pub used_space: i64,
    pub used_inodes: i64,
}

impl QuotaRecord {
    pub fn limits(max_space: i64, max_inodes: i64) -> Self {
        Self {
            max_space,
            max_inodes,
            ..Self::default()
        }
    }

    /// Clamp usage to zero and raise limits that fell below usage.
    pub fn sanitize(&mut self) {
        if self.used_space < 0 {
            self.used_space = 0;
        }
        if self.max_space > 0 && self.max_space < self.used_space {
            self.max_space = self.used_space;
        }
        if self.used_inodes < 0 {
            self.used_inodes = 0;
        }
        if self.max_inodes > 0 && self.max_inodes < self.used_inodes {
            self.max_inodes = self.used_inodes;
        }
    }

    pub fn encode(&self) -> [u8; QUOTA_BYTES] {
        let mut buf = [0u8; QUOTA_BYTES];
        buf[0..8].copy_from_slice(&self.max_space.to_be_bytes());
        buf[8..16].copy_from_slice(&self.max_inodes.to_be_bytes());
        buf[16..24].copy_from_slice(&self.used_space.to_be_bytes());
        buf[24..32].copy_from_slice(&self.used_inodes.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != QUOTA_BYTES {
            return Err(MetaError::Corrupt {
                what: "quota record",
                len: buf.len(),
            });
        }
        let field = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            i64::from_be_bytes(b)
        };
        Ok(Self {
            max_space: field(0),
            max_inodes: field(8),
            used_space: field(16),
            used_inodes: field(24),
        })
    }
}

/// Live quota shared between callers and the flusher.
#[derive(Debug, Default)]
pub struct Quota {
    max_space: AtomicI64,
    max_inodes: AtomicI64,
    used_space: AtomicI64,
    used_inodes: AtomicI64,
    pending_space: AtomicI64,
    pending_inodes: AtomicI64,
}

/// Point-in-time view of a [`Quota`], pending deltas included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QuotaSnapshot {
    pub max_space: i64,
    pub max_inodes: i64,
    pub used_space: i64,
    pub used_inodes: i64,
    pub pending_space: i64,
    pub pending_inodes: i64,
}

impl Quota {
    pub fn new(record: QuotaRecord) -> Self {
        let q = Self::default();
        q.replace(record);
        q
    }

    /// True when applying the delta would push a limited dimension past its
    /// limit. Releases never exceed.
    pub fn check(&self, space: i64, inodes: i64) -> bool {
        if space > 0 {
            let max = self.max_space.load(Ordering::Acquire);
            if max > 0
                && self.used_space.load(Ordering::Acquire)
                    + self.pending_space.load(Ordering::Acquire)
                    + space
                    > max
            {
                return true;
            }
        }
        if inodes > 0 {
            let max = self.max_inodes.load(Ordering::Acquire);
            if max > 0
                && self.used_inodes.load(Ordering::Acquire)
                    + self.pending_inodes.load(Ordering::Acquire)
                    + inodes
                    > max
            {
                return true;
            }
        }
        false
    }

    pub fn update(&self, space: i64, inodes: i64) {
        self.pending_space.fetch_add(space, Ordering::AcqRel);
        self.pending_inodes.fetch_add(inodes, Ordering::AcqRel);
    }

    /// Zero the pending counters and return what they held.
    pub fn take_pending(&self) -> (i64, i64) {
        (
            self.pending_space.swap(0, Ordering::AcqRel),
            self.pending_inodes.swap(0, Ordering::AcqRel),
        )
    }

    /// Fold a flushed delta into the durable baseline.
    pub fn commit(&self, space: i64, inodes: i64) {
        self.used_space.fetch_add(space, Ordering::AcqRel);
        self.used_inodes.fetch_add(inodes, Ordering::AcqRel);
    }

    /// Hand back a delta whose flush failed.
    pub fn restore(&self, space: i64, inodes: i64) {
        self.update(space, inodes);
    }

    /// Adopt a stored record. Pending deltas are kept.
    pub fn replace(&self, record: QuotaRecord) {
        self.max_space.store(record.max_space, Ordering::Release);
        self.max_inodes.store(record.max_inodes, Ordering::Release);
        self.used_space.store(record.used_space, Ordering::Release);
        self.used_inodes.store(record.used_inodes, Ordering::Release);
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot {
            max_space: self.max_space.load(Ordering::Acquire),
            max_inodes: self.max_inodes.load(Ordering::Acquire),
            used_space: self.used_space.load(Ordering::Acquire),
            used_inodes: self.used_inodes.load(Ordering::Acquire),
            pending_space: self.pending_space.load(Ordering::Acquire),
            pending_inodes: self.pending_inodes.load(Ordering::Acquire),
        }
    }

    pub fn record(&self) -> QuotaRecord {
        let s = self.snapshot();
        QuotaRecord {
            max_space: s.max_space,
            max_inodes: s.max_inodes,
            used_space: s.used_space,
            used_inodes: s.used_inodes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_against_used_plus_pending() {
        let q = Quota::new(QuotaRecord {
            max_space: 1000,
            used_space: 900,
            ..Default::default()
        });
        assert!(q.check(200, 0));
        assert!(!q.check(50, 0));
        q.update(60, 0);
        assert!(q.check(50, 0));
        // releases are always admitted
        assert!(!q.check(-500, 0));
    }

    #[test]
    fn non_positive_limit_is_unlimited() {
        let q = Quota::new(QuotaRecord::limits(0, -1));
        assert!(!q.check(i64::MAX / 2, 1 << 40));
    }

    #[test]
    fn flush_cycle() {
        let q = Quota::new(QuotaRecord::limits(0, 10));
        q.update(4096, 1);
        q.update(4096, 1);
        let (space, inodes) = q.take_pending();
        assert_eq!((space, inodes), (8192, 2));
        q.update(100, 0);
        q.commit(space, inodes);
        let s = q.snapshot();
        assert_eq!((s.used_space, s.used_inodes), (8192, 2));
        assert_eq!((s.pending_space, s.pending_inodes), (100, 0));

        let (space, inodes) = q.take_pending();
        q.restore(space, inodes);
        assert_eq!(q.snapshot().pending_space, 100);
        assert_eq!(q.snapshot().used_space, 8192);
    }

    #[test]
    fn sanitize_heals_negative_usage_and_low_limits() {
        let mut r = QuotaRecord {
            max_space: 100,
            max_inodes: 5,
            used_space: 300,
            used_inodes: -4,
        };
        r.sanitize();
        assert_eq!(r.max_space, 300);
        assert_eq!(r.used_inodes, 0);
        assert_eq!(r.max_inodes, 5);
    }

    #[test]
    fn record_codec() {
        let r = QuotaRecord {
            max_space: 1 << 30,
            max_inodes: -1,
            used_space: 4096,
            used_inodes: 3,
        };
        assert_eq!(QuotaRecord::decode(&r.encode()).unwrap(), r);
        assert!(matches!(
            QuotaRecord::decode(&r.encode()[..31]),
            Err(MetaError::Corrupt { len: 31, .. })
        ));
    }
}
