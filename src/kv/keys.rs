//! Key layout.
//!
//! ```text
//!   C<name>                          counter (8-byte LE)
//!   A<ino:8>I                        inode attributes
//!   A<ino:8>D<name>                  directory entry
//!   A<ino:8>C<indx:4>                chunk slice log
//!   K<id:8><size:4>                  extra slice references
//!   D<ino:8><length:8>               file waiting for data deletion
//!   F<ino:8>                         BSD locks of a file
//!   P<ino:8><sid:8><owner:8>         POSIX lock ledger of one owner
//!   QD<ino:8> / QU<uid:8> / QG<gid:8> quota records
//! ```
//!
//! Integers are big-endian so that scans come back in numeric order.

use crate::meta::Ino;
use crate::quota::QuotaKind;

pub const NEXT_INODE: &str = "nextInode";
pub const NEXT_SLICE: &str = "nextChunk";
pub const USED_SPACE: &str = "usedSpace";
pub const TOTAL_INODES: &str = "totalInodes";

fn build(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for p in parts {
        key.extend_from_slice(p);
    }
    key
}

fn u64_at(key: &[u8], at: usize) -> Option<u64> {
    key.get(at..at + 8)?.try_into().ok().map(u64::from_be_bytes)
}

fn u32_at(key: &[u8], at: usize) -> Option<u32> {
    key.get(at..at + 4)?.try_into().ok().map(u32::from_be_bytes)
}

pub fn counter(name: &str) -> Vec<u8> {
    build(&[b"C", name.as_bytes()])
}

pub fn inode(ino: Ino) -> Vec<u8> {
    build(&[b"A", &ino.to_be_bytes(), b"I"])
}

pub fn dentry(parent: Ino, name: &str) -> Vec<u8> {
    build(&[b"A", &parent.to_be_bytes(), b"D", name.as_bytes()])
}

pub fn dentry_prefix(parent: Ino) -> Vec<u8> {
    build(&[b"A", &parent.to_be_bytes(), b"D"])
}

pub fn chunk(ino: Ino, indx: u32) -> Vec<u8> {
    build(&[b"A", &ino.to_be_bytes(), b"C", &indx.to_be_bytes()])
}

pub fn chunk_prefix(ino: Ino) -> Vec<u8> {
    build(&[b"A", &ino.to_be_bytes(), b"C"])
}

/// `(inode, index)` of a chunk key; `None` for any other `A` key.
pub fn parse_chunk(key: &[u8]) -> Option<(Ino, u32)> {
    if key.len() != 14 || key[0] != b'A' || key[9] != b'C' {
        return None;
    }
    Some((u64_at(key, 1)?, u32_at(key, 10)?))
}

pub fn slice_ref(id: u64, size: u32) -> Vec<u8> {
    build(&[b"K", &id.to_be_bytes(), &size.to_be_bytes()])
}

pub fn parse_slice_ref(key: &[u8]) -> Option<(u64, u32)> {
    if key.len() != 13 || key[0] != b'K' {
        return None;
    }
    Some((u64_at(key, 1)?, u32_at(key, 9)?))
}

pub fn delfile(ino: Ino, length: u64) -> Vec<u8> {
    build(&[b"D", &ino.to_be_bytes(), &length.to_be_bytes()])
}

pub fn parse_delfile(key: &[u8]) -> Option<(Ino, u64)> {
    if key.len() != 17 || key[0] != b'D' {
        return None;
    }
    Some((u64_at(key, 1)?, u64_at(key, 9)?))
}

pub fn flock(ino: Ino) -> Vec<u8> {
    build(&[b"F", &ino.to_be_bytes()])
}

pub fn plock(ino: Ino, sid: u64, owner: u64) -> Vec<u8> {
    build(&[b"P", &ino.to_be_bytes(), &sid.to_be_bytes(), &owner.to_be_bytes()])
}

pub fn plock_prefix(ino: Ino) -> Vec<u8> {
    build(&[b"P", &ino.to_be_bytes()])
}

/// `(sid, owner)` of a plock key.
pub fn parse_plock(key: &[u8]) -> Option<(u64, u64)> {
    if key.len() != 25 || key[0] != b'P' {
        return None;
    }
    Some((u64_at(key, 9)?, u64_at(key, 17)?))
}

pub fn quota_prefix(kind: QuotaKind) -> &'static [u8] {
    match kind {
        QuotaKind::Dir => b"QD",
        QuotaKind::User => b"QU",
        QuotaKind::Group => b"QG",
    }
}

pub fn quota(kind: QuotaKind, key: u64) -> Vec<u8> {
    build(&[quota_prefix(kind), &key.to_be_bytes()])
}

pub fn parse_quota(key: &[u8]) -> Option<u64> {
    if key.len() != 10 || key[0] != b'Q' {
        return None;
    }
    u64_at(key, 2)
}

/// Smallest key greater than every key starting with `prefix`, if any.
pub fn next_key(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.pop() {
        if last < 0xff {
            next.push(last + 1);
            return Some(next);
        }
    }
    None
}

/// Printable form of a key for logs and errors.
pub fn display(key: &[u8]) -> String {
    key.escape_ascii().to_string()
}
