use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use rand::Rng;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use chunkmeta::config::{Cli, Command, MetaConfig};
use chunkmeta::kv::MemKv;
use chunkmeta::lock::{query, update_locks, FlockType, LockType, RangeLock};
use chunkmeta::meta::{MemObjectStore, Meta, ROOT_INODE};
use chunkmeta::quota::{Quota, QuotaKind, QuotaRecord};
use chunkmeta::slice::{build_slices, compact_window, skip_some, Slice, CHUNK_SIZE};
use chunkmeta::{Context, MetaError, Result};

/// Install the global subscriber: stderr always, plus a file when asked.
fn init_logging(log_file: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("/tmp"));
            let name = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("chunkmeta.log"));
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = fmt::layer().with_writer(writer).with_ansi(false).with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false));
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("chunkmeta: logging disabled: {}", e);
    }
    guard
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Stress {
            threads,
            ops,
            files,
            quota_space,
            config,
            log_file,
        } => {
            let _guard = init_logging(log_file.as_deref());
            let config = match config {
                Some(path) => MetaConfig::from_json_file(&path).unwrap_or_else(|e| {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }),
                None => MetaConfig::default(),
            };
            match stress(config, threads.max(1), ops, files.max(1), quota_space) {
                Ok(0) => eprintln!("chunkmeta: all invariants hold"),
                Ok(n) => {
                    eprintln!("chunkmeta: {} invariant violations", n);
                    std::process::exit(2);
                }
                Err(e) => {
                    error!("Stress run failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Command::Demo { log_file } => {
            let _guard = init_logging(log_file.as_deref());
            if let Err(e) = demo() {
                error!("Demo failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}

/// Outcome counters of one worker.
#[derive(Debug, Default)]
struct Tally {
    ops: usize,
    rejected: usize,
    failed: usize,
}

fn worker(meta: &Meta, id: u64, inodes: &[u64], ops: usize) -> Tally {
    let ctx = Context::with_ids(1000 + id as u32 % 2, 100);
    let mut rng = rand::thread_rng();
    let mut tally = Tally::default();
    for _ in 0..ops {
        let ino = inodes[rng.gen_range(0..inodes.len())];
        let indx = rng.gen_range(0..2u32);
        let res = match rng.gen_range(0..100) {
            0..=54 => meta.new_slice_id(&ctx).and_then(|sid| {
                let len = rng.gen_range(1..=64 * 1024u32);
                let pos = rng.gen_range(0..CHUNK_SIZE / 64);
                meta.write_chunk(&ctx, ino, indx, Slice::written(pos, sid, len))
            }),
            55..=74 => meta.read_chunk(&ctx, ino, indx).map(|_| ()),
            75..=79 => {
                let length = rng.gen_range(0..2 * u64::from(CHUNK_SIZE));
                meta.truncate(&ctx, ino, length)
            }
            80..=84 => meta.compact_chunk(&ctx, ino, indx, false).map(|_| ()),
            85..=94 => {
                let start = rng.gen_range(0..1000u64);
                let end = start + rng.gen_range(0..100u64);
                let ltype = match rng.gen_range(0..3) {
                    0 => LockType::Read,
                    1 => LockType::Write,
                    _ => LockType::Unlocked,
                };
                meta.setlk(&ctx, ino, id, false, ltype, start, end, id as u32)
            }
            _ => {
                let ltype = match rng.gen_range(0..3) {
                    0 => Some(FlockType::Read),
                    1 => Some(FlockType::Write),
                    _ => None,
                };
                meta.flock(&ctx, ino, id, ltype, false)
            }
        };
        tally.ops += 1;
        match res {
            Ok(()) => {}
            Err(MetaError::QuotaExceeded(_)) | Err(MetaError::NoSpace) | Err(MetaError::WouldBlock) => {
                tally.rejected += 1
            }
            Err(e) => {
                warn!("worker {}: {}", id, e);
                tally.failed += 1;
            }
        }
    }
    tally
}

fn stress(config: MetaConfig, threads: usize, ops: usize, files: usize, quota_space: i64) -> Result<usize> {
    let store = Arc::new(MemObjectStore::new());
    let kv = Arc::new(MemKv::new());
    let meta = Arc::new(Meta::new(kv.clone(), store.clone(), config)?);
    let ctx = Context::background();
    meta.init(&ctx)?;
    let workers = meta.start_background()?;

    let (work, _) = meta.mkdir(&ctx, ROOT_INODE, "work", 0o755)?;
    if quota_space > 0 {
        meta.set_quota(&ctx, QuotaKind::Dir, work, quota_space, 0)?;
    }
    let mut inodes = Vec::with_capacity(files);
    for i in 0..files {
        let (ino, _) = meta.create(&ctx, work, &format!("f{i}"), 0o644)?;
        inodes.push(ino);
    }
    info!(
        "Stress: {} threads x {} ops over {} files (quota {})",
        threads, ops, files, quota_space
    );

    let started = Instant::now();
    let inodes = Arc::new(inodes);
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let meta = meta.clone();
            let inodes = inodes.clone();
            std::thread::Builder::new()
                .name(format!("stress-{t}"))
                .spawn(move || worker(&meta, t as u64 + 1, &inodes, ops))
        })
        .collect::<std::io::Result<_>>()?;
    let mut total = Tally::default();
    for h in handles {
        match h.join() {
            Ok(t) => {
                total.ops += t.ops;
                total.rejected += t.rejected;
                total.failed += t.failed;
            }
            Err(_) => total.failed += 1,
        }
    }
    workers.stop();
    info!(
        "Stress done in {:?}: {} ops, {} rejected, {} failed, {} commits, {} conflicts",
        started.elapsed(),
        total.ops,
        total.rejected,
        total.failed,
        kv.commits(),
        kv.conflicts()
    );

    let mut violations = total.failed;
    meta.compact_all(&ctx)?;
    for &ino in inodes.iter() {
        for indx in 0..2 {
            let slices = meta.read_chunk(&ctx, ino, indx)?;
            let mut at = 0;
            for s in &slices {
                if s.pos != at {
                    error!("chunk {}:{} does not tile at {}: {:?}", ino, indx, at, s);
                    violations += 1;
                }
                at = s.end();
            }
            for s in meta.chunk_log(&ctx, ino, indx)? {
                if !s.is_hole() && store.is_deleted(s.id, s.size) {
                    error!("chunk {}:{} references deleted slice {}", ino, indx, s.id);
                    violations += 1;
                }
            }
        }
        for (owner, ls) in meta.list_plocks(&ctx, ino)? {
            if ls.windows(2).any(|w| w[0].end >= w[1].start) {
                error!("locks of {:?} on {} overlap: {:?}", owner, ino, ls);
                violations += 1;
            }
        }
    }
    if quota_space > 0 {
        let check = meta.check_quota(&ctx, QuotaKind::Dir, work, false)?;
        if !check.is_consistent() {
            error!("quota drifted: {:?}", check);
            violations += 1;
        }
    } else {
        meta.flush_quotas(&ctx)?;
    }

    match serde_json::to_string_pretty(&meta.status()) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!("Render status: {}", e),
    }
    Ok(violations)
}

fn demo() -> Result<()> {
    // 1. later writes win
    let log = [Slice::written(0, 10, 100), Slice::written(50, 20, 50)];
    println!("resolve {:?}\n     -> {:?}", log, build_slices(&log));

    // 2. unlocking the middle of a write lock
    let ls = update_locks(Vec::new(), RangeLock::new(LockType::Write, 1, 0, 100));
    let ls = update_locks(ls, RangeLock::new(LockType::Unlocked, 1, 40, 60));
    println!("locks after unlock [40, 60]: {:?}", ls);
    println!("query [45, 50]: {:?}", query(&ls, 45, 50));

    // 3. admission
    let q = Quota::new(QuotaRecord {
        max_space: 1000,
        used_space: 900,
        ..QuotaRecord::default()
    });
    println!("quota 900/1000: +200 rejected={}, +50 rejected={}", q.check(200, 0), q.check(50, 0));

    // 4. usage goes to the nearest quota
    let meta = Meta::new(Arc::new(MemKv::new()), Arc::new(MemObjectStore::new()), MetaConfig::default())?;
    let ctx = Context::background();
    meta.init(&ctx)?;
    let (top, _) = meta.mkdir(&ctx, ROOT_INODE, "top", 0o755)?;
    meta.set_quota(&ctx, QuotaKind::Dir, top, 1 << 30, 0)?;
    let (mid, _) = meta.mkdir(&ctx, top, "mid", 0o755)?;
    let (leaf, _) = meta.mkdir(&ctx, mid, "leaf", 0o755)?;
    let (file, _) = meta.create(&ctx, leaf, "file", 0o644)?;
    meta.write_chunk(&ctx, file, 0, Slice::written(0, meta.new_slice_id(&ctx)?, 10))?;
    meta.flush_quotas(&ctx)?;
    println!("quota of {}: {:?}", top, meta.get_quota(&ctx, QuotaKind::Dir, top)?);

    // 5. many tiny overlapping writes fold into one entry
    let log: Vec<Slice> = (0..300).map(|i| Slice::written(0, i + 1, 1)).collect();
    let (head, tail) = skip_some(&log);
    let plan = compact_window(&log, head, tail);
    println!(
        "300 overlapping writes: window [{}, {}), write {}, delete {}, result {:?}",
        head,
        tail,
        plan.write,
        plan.delete,
        plan.apply(&log, 301)
    );

    match serde_json::to_string_pretty(&meta.status()) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!("Render status: {}", e),
    }
    Ok(())
}
