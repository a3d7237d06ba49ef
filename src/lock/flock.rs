use std::collections::HashMap;

use crate::error::{MetaError, Result};

const FLOCK_BYTES: usize = 17;

/// Session plus caller-chosen owner token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockOwner {
    pub sid: u64,
    pub owner: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlockType {
    Read,
    Write,
}

impl FlockType {
    fn tag(self) -> u8 {
        match self {
            FlockType::Read => b'R',
            FlockType::Write => b'W',
        }
    }
}

pub type FlockMap = HashMap<LockOwner, FlockType>;

pub fn encode_flocks(ls: &FlockMap) -> Vec<u8> {
    let mut owners: Vec<_> = ls.iter().collect();
    owners.sort_by_key(|(o, _)| **o);
    let mut buf = Vec::with_capacity(owners.len() * FLOCK_BYTES);
    for (o, t) in owners {
        buf.extend_from_slice(&o.sid.to_be_bytes());
        buf.extend_from_slice(&o.owner.to_be_bytes());
        buf.push(t.tag());
    }
    buf
}

pub fn decode_flocks(buf: &[u8]) -> Result<FlockMap> {
    if buf.len() % FLOCK_BYTES != 0 {
        return Err(MetaError::Corrupt {
            what: "flock table",
            len: buf.len(),
        });
    }
    let mut ls = FlockMap::new();
    for rec in buf.chunks_exact(FLOCK_BYTES) {
        let mut sid = [0u8; 8];
        let mut owner = [0u8; 8];
        sid.copy_from_slice(&rec[0..8]);
        owner.copy_from_slice(&rec[8..16]);
        let ltype = match rec[16] {
            b'R' => FlockType::Read,
            b'W' => FlockType::Write,
            other => {
                return Err(MetaError::Invalid(format!("flock tag {other:#x}")));
            }
        };
        ls.insert(
            LockOwner {
                sid: u64::from_be_bytes(sid),
                owner: u64::from_be_bytes(owner),
            },
            ltype,
        );
    }
    Ok(ls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_codec() {
        let mut ls = FlockMap::new();
        ls.insert(LockOwner { sid: 1, owner: 9 }, FlockType::Read);
        ls.insert(LockOwner { sid: 2, owner: 3 }, FlockType::Write);
        let buf = encode_flocks(&ls);
        assert_eq!(buf.len(), 34);
        assert_eq!(buf[16], b'R');
        assert_eq!(decode_flocks(&buf).unwrap(), ls);
        assert!(decode_flocks(&buf[..30]).is_err());
    }
}
