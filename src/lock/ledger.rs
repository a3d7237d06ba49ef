use super::{LockType, RangeLock};

/// Apply `nl` to a sorted, non-overlapping ledger and return the new one.
///
/// The request is carved against each existing range in turn: whichever of
/// the two sticks out is split at the boundary, the overlapping piece takes
/// the request's type and owner, and the rest of the request moves on to the
/// next range. Unlocked and empty pieces are dropped afterwards and touching
/// ranges with the same type and owner are merged.
pub fn update_locks(mut ls: Vec<RangeLock>, mut nl: RangeLock) -> Vec<RangeLock> {
    let size = ls.len();
    let mut open = nl.start <= nl.end;
    for i in 0..size {
        if !open {
            break;
        }
        let mut l = ls[i];
        if nl.start < l.start && nl.end >= l.start {
            // part of the request before l
            ls.push(RangeLock { end: l.start - 1, ..nl });
            nl.start = l.start;
        }
        if nl.start > l.start && nl.start <= l.end {
            // part of l before the request
            ls.push(RangeLock {
                end: nl.start - 1,
                ..l
            });
            ls[i].start = nl.start;
            l = ls[i];
        }
        if nl.start == l.start {
            ls[i].ltype = nl.ltype;
            ls[i].owner = nl.owner;
            if l.end > nl.end {
                ls[i].end = nl.end;
                ls.push(RangeLock {
                    start: nl.end + 1,
                    ..l
                });
            }
            match ls[i].end.checked_add(1) {
                Some(next) => nl.start = next,
                None => open = false,
            }
        }
        open = open && nl.start <= nl.end;
    }
    if open {
        ls.push(nl);
    }
    ls.sort_by_key(|l| l.start);

    let mut out: Vec<RangeLock> = Vec::with_capacity(ls.len());
    for l in ls {
        if l.ltype == LockType::Unlocked || l.start > l.end {
            continue;
        }
        if let Some(prev) = out.last_mut() {
            if prev.ltype == l.ltype
                && prev.owner == l.owner
                && prev.end.checked_add(1) == Some(l.start)
            {
                prev.end = l.end;
                continue;
            }
        }
        out.push(l);
    }
    out
}

/// First range of `ls` intersecting `[start, end]`, or an unlocked record.
pub fn query(ls: &[RangeLock], start: u64, end: u64) -> RangeLock {
    ls.iter()
        .find(|l| l.intersects(start, end))
        .copied()
        .unwrap_or_else(RangeLock::unlocked)
}

/// First range of another owner's ledger that a `ltype` request on
/// `[start, end]` cannot coexist with. Two read locks never conflict.
pub fn conflicting(ls: &[RangeLock], ltype: LockType, start: u64, end: u64) -> Option<RangeLock> {
    ls.iter()
        .find(|l| {
            (ltype == LockType::Write || l.ltype == LockType::Write) && l.intersects(start, end)
        })
        .copied()
}
