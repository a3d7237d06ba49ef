//! In-memory optimistic backend.
//!
//! Every committed write stamps the key with a fresh version from one global
//! counter. A transaction remembers the version of every key it read and the
//! ranges it scanned; at commit, any key whose version moved, vanished, or
//! newly appeared inside a scanned range fails the commit with a conflict.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::keys::display;
use super::{KeyValue, KvClient, KvTxn};
use crate::error::{MetaError, Result};

#[derive(Debug)]
struct Item {
    ver: u64,
    value: Vec<u8>,
}

#[derive(Debug, Default)]
struct Store {
    items: BTreeMap<Vec<u8>, Item>,
    last_ver: u64,
}

impl Store {
    fn range(&self, begin: &[u8], end: &[u8]) -> impl Iterator<Item = (&Vec<u8>, &Item)> {
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end.to_vec())
        };
        self.items
            .range((Bound::Included(begin.to_vec()), upper))
    }
}

#[derive(Debug, Default)]
pub struct MemKv {
    store: Mutex<Store>,
    forced_conflicts: AtomicU32,
    commits: AtomicU64,
    conflicts: AtomicU64,
}

struct MemTxn<'a> {
    store: &'a Mutex<Store>,
    /// Version seen per key read; 0 when the key was absent.
    observed: HashMap<Vec<u8>, u64>,
    scanned: Vec<(Vec<u8>, Vec<u8>)>,
    /// Buffered writes; `None` deletes.
    buffer: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl KvTxn for MemTxn<'_> {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(v) = self.buffer.get(key) {
            return Ok(v.clone());
        }
        let store = self.store.lock();
        match store.items.get(key) {
            Some(it) => {
                self.observed.insert(key.to_vec(), it.ver);
                Ok(Some(it.value.clone()))
            }
            None => {
                self.observed.insert(key.to_vec(), 0);
                Ok(None)
            }
        }
    }

    fn batch_get(&mut self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        let store = self.store.lock();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(v) = self.buffer.get(key) {
                out.push(v.clone());
                continue;
            }
            match store.items.get(key) {
                Some(it) => {
                    self.observed.insert(key.clone(), it.ver);
                    out.push(Some(it.value.clone()));
                }
                None => {
                    self.observed.insert(key.clone(), 0);
                    out.push(None);
                }
            }
        }
        Ok(out)
    }

    fn scan_range(&mut self, begin: &[u8], end: &[u8]) -> Result<Vec<KeyValue>> {
        if !end.is_empty() && end <= begin {
            return Ok(Vec::new());
        }
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        {
            let store = self.store.lock();
            for (k, it) in store.range(begin, end) {
                self.observed.insert(k.clone(), it.ver);
                merged.insert(k.clone(), it.value.clone());
            }
        }
        self.scanned.push((begin.to_vec(), end.to_vec()));
        for (k, v) in &self.buffer {
            let in_range = k.as_slice() >= begin && (end.is_empty() || k.as_slice() < end);
            if !in_range {
                continue;
            }
            match v {
                Some(v) => merged.insert(k.clone(), v.clone()),
                None => merged.remove(k),
            };
        }
        Ok(merged.into_iter().collect())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.buffer.insert(key.to_vec(), Some(value.to_vec()));
    }

    fn delete(&mut self, key: &[u8]) {
        self.buffer.insert(key.to_vec(), None);
    }
}

impl MemTxn<'_> {
    fn validate(&self, store: &Store) -> Result<()> {
        for (k, ver) in &self.observed {
            let now = store.items.get(k).map(|it| it.ver).unwrap_or(0);
            if now != *ver {
                return Err(MetaError::Conflict { key: display(k) });
            }
        }
        for (begin, end) in &self.scanned {
            for (k, _) in store.range(begin, end) {
                if !self.observed.contains_key(k) {
                    return Err(MetaError::Conflict { key: display(k) });
                }
            }
        }
        Ok(())
    }
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writing commits fail with a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.store.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a key outside any transaction.
    pub fn raw_get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.store.lock().items.get(key).map(|it| it.value.clone())
    }

    /// Every pair under `prefix`, outside any transaction.
    pub fn raw_scan(&self, prefix: &[u8]) -> Vec<KeyValue> {
        let end = super::keys::next_key(prefix).unwrap_or_default();
        self.store
            .lock()
            .range(prefix, &end)
            .map(|(k, it)| (k.clone(), it.value.clone()))
            .collect()
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl KvClient for MemKv {
    fn name(&self) -> &'static str {
        "memkv"
    }

    fn txn(&self, f: &mut dyn FnMut(&mut dyn KvTxn) -> Result<()>) -> Result<()> {
        let mut tx = MemTxn {
            store: &self.store,
            observed: HashMap::new(),
            scanned: Vec::new(),
            buffer: BTreeMap::new(),
        };
        f(&mut tx)?;
        if tx.buffer.is_empty() {
            return Ok(());
        }
        if self.take_forced_conflict() {
            self.conflicts.fetch_add(1, Ordering::Relaxed);
            return Err(MetaError::Conflict {
                key: "<injected>".into(),
            });
        }

        let mut store = self.store.lock();
        if let Err(e) = tx.validate(&store) {
            self.conflicts.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        for (k, v) in std::mem::take(&mut tx.buffer) {
            match v {
                Some(value) => {
                    store.last_ver += 1;
                    let ver = store.last_ver;
                    store.items.insert(k, Item { ver, value });
                }
                None => {
                    store.items.remove(&k);
                }
            }
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(kv: &MemKv, key: &[u8], value: &[u8]) {
        kv.txn(&mut |tx: &mut dyn KvTxn| {
            tx.set(key, value);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn reads_see_own_writes() {
        let kv = MemKv::new();
        put(&kv, b"a1", b"x");
        kv.txn(&mut |tx: &mut dyn KvTxn| {
            tx.set(b"a2", b"y");
            tx.delete(b"a1");
            assert_eq!(tx.get(b"a2")?, Some(b"y".to_vec()));
            assert_eq!(tx.get(b"a1")?, None);
            let pairs = tx.scan_prefix(b"a")?;
            assert_eq!(pairs, vec![(b"a2".to_vec(), b"y".to_vec())]);
            Ok(())
        })
        .unwrap();
        assert_eq!(kv.raw_get(b"a1"), None);
    }

    #[test]
    fn stale_read_conflicts() {
        let kv = MemKv::new();
        put(&kv, b"k", b"1");
        let err = kv
            .txn(&mut |tx: &mut dyn KvTxn| {
                let v = tx.get(b"k")?;
                assert_eq!(v, Some(b"1".to_vec()));
                // another writer commits in between
                put(&kv, b"k", b"2");
                tx.set(b"k", b"3");
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, MetaError::Conflict { .. }));
        assert_eq!(kv.raw_get(b"k"), Some(b"2".to_vec()));
        assert_eq!(kv.conflicts(), 1);
    }

    #[test]
    fn stale_batch_read_conflicts() {
        let kv = MemKv::new();
        put(&kv, b"a", b"1");
        put(&kv, b"b", b"1");
        let keys = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let err = kv
            .txn(&mut |tx: &mut dyn KvTxn| {
                let got = tx.batch_get(&keys)?;
                assert_eq!(got, vec![Some(b"1".to_vec()), Some(b"1".to_vec()), None]);
                put(&kv, b"b", b"2");
                tx.set(b"a", b"3");
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, MetaError::Conflict { ref key } if key.contains('b')));
        assert_eq!(kv.raw_get(b"a"), Some(b"1".to_vec()));

        // a key that was absent and then appears is just as stale
        let err = kv
            .txn(&mut |tx: &mut dyn KvTxn| {
                tx.batch_get(&keys)?;
                put(&kv, b"c", b"new");
                tx.set(b"a", b"3");
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, MetaError::Conflict { .. }));
    }

    #[test]
    fn batch_read_sees_own_writes() {
        let kv = MemKv::new();
        put(&kv, b"a", b"1");
        kv.txn(&mut |tx: &mut dyn KvTxn| {
            tx.set(b"b", b"2");
            tx.delete(b"a");
            assert_eq!(tx.batch_get(&[b"a".to_vec(), b"b".to_vec()])?, vec![None, Some(b"2".to_vec())]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn delete_and_recreate_is_not_mistaken_for_unchanged() {
        let kv = MemKv::new();
        put(&kv, b"k", b"1");
        let err = kv
            .txn(&mut |tx: &mut dyn KvTxn| {
                tx.get(b"k")?;
                kv.txn(&mut |other: &mut dyn KvTxn| {
                    other.delete(b"k");
                    Ok(())
                })?;
                put(&kv, b"k", b"1");
                tx.set(b"other", b"x");
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, MetaError::Conflict { .. }));
    }

    #[test]
    fn phantom_in_scanned_range_conflicts() {
        let kv = MemKv::new();
        put(&kv, b"P1", b"a");
        let err = kv
            .txn(&mut |tx: &mut dyn KvTxn| {
                assert_eq!(tx.scan_prefix(b"P")?.len(), 1);
                put(&kv, b"P2", b"b");
                tx.set(b"Q", b"summary");
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, MetaError::Conflict { .. }));
    }

    #[test]
    fn read_only_transaction_never_conflicts() {
        let kv = MemKv::new();
        put(&kv, b"k", b"1");
        kv.txn(&mut |tx: &mut dyn KvTxn| {
            tx.get(b"k")?;
            put(&kv, b"k", b"2");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn injected_conflicts_are_consumed() {
        let kv = MemKv::new();
        kv.inject_conflicts(1);
        let first = kv.txn(&mut |tx: &mut dyn KvTxn| {
            tx.set(b"k", b"v");
            Ok(())
        });
        assert!(first.is_err());
        put(&kv, b"k", b"v");
        assert_eq!(kv.commits(), 1);
    }
}
