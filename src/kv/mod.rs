//! Transactional key-value contract the metadata engine is written against.
//!
//! A backend only has to run a closure inside one optimistic transaction and
//! report a retryable error when the commit loses a race. Retrying, backoff,
//! cancellation and read-only enforcement live in [`TxnRunner`].

pub mod keys;
pub mod mem;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::MetaConfig;
use crate::context::Context;
use crate::error::{MetaError, Result};

pub use mem::MemKv;

pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Operations available inside one transaction. Writes are buffered and
/// become visible to other transactions only on commit.
pub trait KvTxn {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Ordered pairs with `begin <= key < end`; an empty `end` is unbounded.
    fn scan_range(&mut self, begin: &[u8], end: &[u8]) -> Result<Vec<KeyValue>>;

    fn set(&mut self, key: &[u8], value: &[u8]);

    fn delete(&mut self, key: &[u8]);

    /// Point reads of several keys, in the order given.
    fn batch_get(&mut self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    fn scan_prefix(&mut self, prefix: &[u8]) -> Result<Vec<KeyValue>> {
        match keys::next_key(prefix) {
            Some(end) => self.scan_range(prefix, &end),
            None => self.scan_range(prefix, &[]),
        }
    }

    fn exists(&mut self, prefix: &[u8]) -> Result<bool> {
        Ok(!self.scan_prefix(prefix)?.is_empty())
    }

    fn append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut current = self.get(key)?.unwrap_or_default();
        current.extend_from_slice(value);
        self.set(key, &current);
        Ok(())
    }

    /// Add `delta` to an 8-byte little-endian counter and return the result.
    /// A zero delta reads without writing.
    fn incr_by(&mut self, key: &[u8], delta: i64) -> Result<i64> {
        let current = match self.get(key)? {
            Some(buf) => parse_counter(&buf)?,
            None => 0,
        };
        let value = current + delta;
        if delta != 0 {
            self.set(key, &value.to_le_bytes());
        }
        Ok(value)
    }
}

pub fn parse_counter(buf: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = buf.try_into().map_err(|_| MetaError::Corrupt {
        what: "counter",
        len: buf.len(),
    })?;
    Ok(i64::from_le_bytes(bytes))
}

/// A storage backend able to run one optimistic transaction.
pub trait KvClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run `f` once and commit its writes. A lost race is reported as a
    /// retryable error and nothing is written.
    fn txn(&self, f: &mut dyn FnMut(&mut dyn KvTxn) -> Result<()>) -> Result<()>;
}

/// Retry harness shared by every engine operation.
pub struct TxnRunner {
    client: Arc<dyn KvClient>,
    retries: u32,
    max_backoff: Duration,
    read_only: bool,
    restarts: AtomicU64,
}

impl TxnRunner {
    pub fn new(client: Arc<dyn KvClient>, config: &MetaConfig) -> Self {
        Self {
            client,
            retries: config.retries.max(1),
            max_backoff: config.max_backoff(),
            read_only: config.read_only,
            restarts: AtomicU64::new(0),
        }
    }

    pub fn client_name(&self) -> &'static str {
        self.client.name()
    }

    /// Transactions restarted after a conflict since startup.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Run a mutating closure, retrying on conflict.
    pub fn txn<T, F>(&self, ctx: &Context, f: F) -> Result<T>
    where
        F: FnMut(&mut dyn KvTxn) -> Result<T>,
    {
        if self.read_only {
            return Err(MetaError::ReadOnly);
        }
        self.run(ctx, f)
    }

    /// Run a read-only closure; allowed on read-only engines.
    pub fn view<T, F>(&self, ctx: &Context, f: F) -> Result<T>
    where
        F: FnMut(&mut dyn KvTxn) -> Result<T>,
    {
        self.run(ctx, f)
    }

    fn run<T, F>(&self, ctx: &Context, mut f: F) -> Result<T>
    where
        F: FnMut(&mut dyn KvTxn) -> Result<T>,
    {
        let mut last = None;
        for attempt in 0..self.retries {
            ctx.check()?;
            let mut out = None;
            let res = self.client.txn(&mut |tx: &mut dyn KvTxn| {
                out = Some(f(tx)?);
                Ok(())
            });
            match res {
                Ok(()) => {
                    return out.ok_or_else(|| MetaError::Backend {
                        message: format!("{} committed without running the closure", self.client.name()),
                        retryable: false,
                    });
                }
                Err(e) if e.is_retryable() => {
                    self.restarts.fetch_add(1, Ordering::Relaxed);
                    debug!("conflicted transaction, restart it (tried {}): {}", attempt + 1, e);
                    std::thread::sleep(self.backoff(attempt));
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        let err = last.unwrap_or_else(|| MetaError::Conflict {
            key: String::new(),
        });
        warn!("transaction gave up after {} attempts: {}", self.retries, err);
        Err(err)
    }

    /// Random sleep below `(attempt + 1)^2` ms, capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = u64::from(attempt + 1).pow(2).min(self.max_backoff.as_millis() as u64);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..ceiling))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn runner(kv: Arc<MemKv>, retries: u32) -> TxnRunner {
        let config = MetaConfig {
            retries,
            max_backoff_ms: 2,
            ..MetaConfig::default()
        };
        TxnRunner::new(kv, &config)
    }

    #[test]
    fn counters_are_little_endian() {
        let kv = Arc::new(MemKv::new());
        let r = runner(kv.clone(), 3);
        let ctx = Context::background();
        let v = r.txn(&ctx, |tx| tx.incr_by(b"Cx", 5)).unwrap();
        assert_eq!(v, 5);
        assert_eq!(kv.raw_get(b"Cx"), Some(5i64.to_le_bytes().to_vec()));
        let v = r.view(&ctx, |tx| tx.incr_by(b"Cx", 0)).unwrap();
        assert_eq!(v, 5);
    }

    #[test]
    fn conflicts_are_retried() {
        let kv = Arc::new(MemKv::new());
        kv.inject_conflicts(3);
        let r = runner(kv.clone(), 10);
        let calls = AtomicU32::new(0);
        let ctx = Context::background();
        r.txn(&ctx, |tx| {
            calls.fetch_add(1, Ordering::Relaxed);
            tx.set(b"k", b"v");
            Ok(())
        })
        .unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 4);
        assert_eq!(r.restarts(), 3);
        assert_eq!(kv.raw_get(b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn retries_run_out() {
        let kv = Arc::new(MemKv::new());
        kv.inject_conflicts(100);
        let r = runner(kv, 4);
        let err = r
            .txn(&Context::background(), |tx| {
                tx.set(b"k", b"v");
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn closure_errors_propagate_unchanged() {
        let kv = Arc::new(MemKv::new());
        let r = runner(kv.clone(), 10);
        let err = r
            .txn(&Context::background(), |tx| -> Result<()> {
                tx.set(b"k", b"v");
                Err(MetaError::QuotaExceeded("directory 5".into()))
            })
            .unwrap_err();
        assert!(matches!(err, MetaError::QuotaExceeded(_)));
        assert_eq!(kv.raw_get(b"k"), None);
    }

    #[test]
    fn cancelled_context_stops_before_running() {
        let r = runner(Arc::new(MemKv::new()), 10);
        let ctx = Context::background();
        ctx.cancel();
        let err = r.view(&ctx, |tx| tx.get(b"k")).unwrap_err();
        assert!(matches!(err, MetaError::Cancelled));
    }

    #[test]
    fn read_only_rejects_writes_but_allows_reads() {
        let config = MetaConfig {
            read_only: true,
            ..MetaConfig::default()
        };
        let r = TxnRunner::new(Arc::new(MemKv::new()), &config);
        let ctx = Context::background();
        assert!(matches!(
            r.txn(&ctx, |tx| tx.incr_by(b"C", 1)),
            Err(MetaError::ReadOnly)
        ));
        assert_eq!(r.view(&ctx, |tx| tx.get(b"C")).unwrap(), None);
    }

    #[test]
    fn malformed_counter_is_corrupt() {
        let kv = Arc::new(MemKv::new());
        let r = runner(kv, 2);
        let ctx = Context::background();
        r.txn(&ctx, |tx| {
            tx.set(b"Cbad", b"xyz");
            Ok(())
        })
        .unwrap();
        assert!(matches!(
            r.txn(&ctx, |tx| tx.incr_by(b"Cbad", 1)),
            Err(MetaError::Corrupt { len: 3, .. })
        ));
    }
}
