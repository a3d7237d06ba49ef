#![allow(dead_code)]

use std::sync::Arc;

use chunkmeta::config::MetaConfig;
use chunkmeta::kv::MemKv;
use chunkmeta::meta::{MemObjectStore, Meta, ROOT_INODE};
use chunkmeta::slice::Slice;
use chunkmeta::{Context, Ino};

/// An engine over a fresh in-memory backend and object store.
pub struct TestEngine {
    pub kv: Arc<MemKv>,
    pub store: Arc<MemObjectStore>,
    pub meta: Arc<Meta>,
    pub ctx: Context,
}

/// Defaults tuned for tests: short backoff, plenty of retries, no timers.
pub fn test_config() -> MetaConfig {
    MetaConfig {
        retries: 500,
        max_backoff_ms: 2,
        quota_flush_period_ms: 0,
        cleanup_period_ms: 0,
        ..MetaConfig::default()
    }
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: MetaConfig) -> Self {
        Self::on(Arc::new(MemKv::new()), config)
    }

    /// An engine sharing an existing backend.
    pub fn on(kv: Arc<MemKv>, config: MetaConfig) -> Self {
        let store = Arc::new(MemObjectStore::new());
        let meta = Arc::new(Meta::new(kv.clone(), store.clone(), config).expect("valid config"));
        let ctx = Context::background();
        meta.init(&ctx).expect("init engine");
        TestEngine { kv, store, meta, ctx }
    }

    pub fn dir(&self, parent: Ino, name: &str) -> Ino {
        self.meta.mkdir(&self.ctx, parent, name, 0o755).expect("mkdir").0
    }

    pub fn file(&self, parent: Ino, name: &str) -> Ino {
        self.meta.create(&self.ctx, parent, name, 0o644).expect("create").0
    }

    pub fn root_file(&self, name: &str) -> Ino {
        self.file(ROOT_INODE, name)
    }

    /// Write `len` fresh bytes at `pos` of chunk `indx`; returns the slice id.
    pub fn write(&self, ino: Ino, indx: u32, pos: u32, len: u32) -> u64 {
        let id = self.meta.new_slice_id(&self.ctx).expect("slice id");
        self.meta
            .write_chunk(&self.ctx, ino, indx, Slice::written(pos, id, len))
            .expect("write");
        id
    }

    /// Where each of the first `len` bytes of a chunk comes from, traced back
    /// through merged objects; `None` reads as zero.
    pub fn content(&self, ino: Ino, indx: u32, len: u32) -> Vec<Option<(u64, u32)>> {
        let slices = self.meta.read_chunk(&self.ctx, ino, indx).expect("read");
        visible(&self.store, &slices, len)
    }

    /// Every non-hole entry of every given chunk still has its object.
    pub fn assert_live_slices_kept(&self, chunks: &[(Ino, u32)]) {
        for &(ino, indx) in chunks {
            for s in self.meta.chunk_log(&self.ctx, ino, indx).expect("chunk log") {
                assert!(
                    s.is_hole() || !self.store.is_deleted(s.id, s.size),
                    "chunk {ino}:{indx} still references deleted slice {s:?}"
                );
            }
        }
    }
}

pub fn visible(store: &MemObjectStore, slices: &[Slice], len: u32) -> Vec<Option<(u64, u32)>> {
    let mut out = vec![None; len as usize];
    for s in slices.iter().filter(|s| !s.is_hole()) {
        for i in 0..s.len {
            let at = (s.pos + i) as usize;
            if at < out.len() {
                out[at] = Some(store.origin(s.id, s.off + i));
            }
        }
    }
    out
}

/// Expected content after applying `(pos, id, len)` writes in order.
pub fn paint(writes: &[(u32, u64, u32)], len: u32) -> Vec<Option<(u64, u32)>> {
    let mut out = vec![None; len as usize];
    for &(pos, id, n) in writes {
        for i in 0..n {
            let at = (pos + i) as usize;
            if at < out.len() {
                out[at] = Some((id, i));
            }
        }
    }
    out
}
