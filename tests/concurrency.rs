//! Many threads against one engine: no lost writes, no overlapping locks,
//! no quota drift.

mod helpers;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use chunkmeta::lock::{FlockType, LockType};
use chunkmeta::meta::CompactOutcome;
use chunkmeta::quota::QuotaKind;
use chunkmeta::slice::Slice;
use chunkmeta::{Context, MetaError, ROOT_INODE};

use helpers::{paint, TestEngine};

#[test]
fn concurrent_appends_are_all_kept() {
    let e = TestEngine::new();
    let f = e.root_file("f");
    let handles: Vec<_> = (0..8u32)
        .map(|t| {
            let meta = e.meta.clone();
            thread::spawn(move || {
                let ctx = Context::background();
                let mut ids = Vec::new();
                for i in 0..25u32 {
                    let id = meta.new_slice_id(&ctx).unwrap();
                    let pos = t * 10_000 + i * 100;
                    meta.write_chunk(&ctx, f, 0, Slice::written(pos, id, 100))
                        .unwrap();
                    ids.push(id);
                }
                ids
            })
        })
        .collect();
    let mut ids: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    ids.sort_unstable();

    let mut logged: Vec<u64> = e.meta.chunk_log(&e.ctx, f, 0).unwrap().iter().map(|s| s.id).collect();
    logged.sort_unstable();
    assert_eq!(logged, ids);
    assert_eq!(e.meta.get_attr(&e.ctx, f).unwrap().length, 7 * 10_000 + 24 * 100 + 100);
}

#[test]
fn compaction_racing_a_writer_keeps_content() {
    let e = TestEngine::new();
    let f = e.root_file("f");
    let done = Arc::new(AtomicBool::new(false));

    let compactor = {
        let meta = e.meta.clone();
        let done = done.clone();
        thread::spawn(move || {
            let ctx = Context::background();
            let mut compacted = 0;
            while !done.load(Ordering::Acquire) {
                match meta.compact_chunk(&ctx, f, 0, false).unwrap() {
                    CompactOutcome::Compacted { .. } => compacted += 1,
                    CompactOutcome::Skipped => panic!("only one compactor runs"),
                    _ => thread::sleep(Duration::from_micros(200)),
                }
            }
            compacted
        })
    };

    let mut rng = StdRng::seed_from_u64(11);
    let mut writes = Vec::new();
    for _ in 0..300 {
        let pos = rng.gen_range(0..4000u32);
        let len = rng.gen_range(1..=300u32);
        writes.push((pos, e.write(f, 0, pos, len), len));
    }
    done.store(true, Ordering::Release);
    compactor.join().unwrap();

    let expected = paint(&writes, 4300);
    assert_eq!(e.content(f, 0, 4300), expected);
    e.assert_live_slices_kept(&[(f, 0)]);

    e.meta.compact_chunk(&e.ctx, f, 0, true).unwrap();
    assert_eq!(e.content(f, 0, 4300), expected);
    e.assert_live_slices_kept(&[(f, 0)]);
}

#[test]
fn range_locks_never_overlap_across_owners() {
    let e = TestEngine::new();
    let f = e.root_file("f");
    let handles: Vec<_> = (1..=4u64)
        .map(|owner| {
            let meta = e.meta.clone();
            thread::spawn(move || {
                let ctx = Context::background();
                let mut rng = StdRng::seed_from_u64(owner);
                let mut granted = 0;
                for _ in 0..200 {
                    let start = rng.gen_range(0..500u64);
                    let end = start + rng.gen_range(0..50u64);
                    let ltype = match rng.gen_range(0..4) {
                        0 => LockType::Unlocked,
                        1 => LockType::Read,
                        _ => LockType::Write,
                    };
                    match meta.setlk(&ctx, f, owner, false, ltype, start, end, owner as u32) {
                        Ok(()) => granted += 1,
                        Err(MetaError::WouldBlock) => {}
                        Err(e) => panic!("setlk: {e}"),
                    }
                }
                granted
            })
        })
        .collect();
    let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(granted > 0);

    let owners = e.meta.list_plocks(&e.ctx, f).unwrap();
    for (owner, ls) in &owners {
        assert!(ls.windows(2).all(|w| w[0].end < w[1].start), "{owner:?}: {ls:?}");
    }
    for (i, (a, la)) in owners.iter().enumerate() {
        for (b, lb) in &owners[i + 1..] {
            for x in la {
                for y in lb {
                    let overlap = x.start <= y.end && y.start <= x.end;
                    let shared = x.ltype == LockType::Read && y.ltype == LockType::Read;
                    assert!(!overlap || shared, "{a:?} {x:?} conflicts with {b:?} {y:?}");
                }
            }
        }
    }
}

#[test]
fn quota_churn_stays_consistent() {
    let e = TestEngine::new();
    let d = e.dir(ROOT_INODE, "d");
    e.meta.set_quota(&e.ctx, QuotaKind::Dir, d, 0, 0).unwrap();

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let meta = e.meta.clone();
            thread::spawn(move || {
                let ctx = Context::background();
                let mut rng = StdRng::seed_from_u64(100 + t);
                let (sub, _) = meta.mkdir(&ctx, d, &format!("t{t}"), 0o755).unwrap();
                for i in 0..30 {
                    let name = format!("f{i}");
                    let (f, _) = meta.create(&ctx, sub, &name, 0o644).unwrap();
                    let id = meta.new_slice_id(&ctx).unwrap();
                    let len = rng.gen_range(1..20_000u32);
                    meta.write_chunk(&ctx, f, 0, Slice::written(0, id, len))
                        .unwrap();
                    match rng.gen_range(0..3) {
                        0 => meta.unlink(&ctx, sub, &name).unwrap(),
                        1 => meta.truncate(&ctx, f, rng.gen_range(0..40_000)).unwrap(),
                        _ => {}
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let check = e.meta.check_quota(&e.ctx, QuotaKind::Dir, d, false).unwrap();
    assert!(check.is_consistent(), "{check:?}");
    assert!(check.actual_inodes >= 4);
}

#[test]
fn blocking_flock_is_exclusive() {
    let e = TestEngine::new();
    let f = e.root_file("f");
    let inside = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (1..=4u64)
        .map(|owner| {
            let meta = e.meta.clone();
            let inside = inside.clone();
            thread::spawn(move || {
                let ctx = Context::background();
                for _ in 0..10 {
                    meta.flock(&ctx, f, owner, Some(FlockType::Write), true).unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    thread::sleep(Duration::from_millis(1));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    meta.flock(&ctx, f, owner, None, false).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(e.meta.list_flocks(&e.ctx, f).unwrap().is_empty());
}
