use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::Ino;
use crate::error::{MetaError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

impl FileKind {
    fn tag(self) -> u8 {
        match self {
            FileKind::File => 1,
            FileKind::Directory => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(FileKind::File),
            2 => Some(FileKind::Directory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attr {
    pub kind: FileKind,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub length: u64,
    /// Parent directory; meaningful for directories, which have exactly one.
    pub parent: Ino,
    pub mtime: i64,
    pub ctime: i64,
}

impl Attr {
    pub fn new(kind: FileKind, mode: u16, uid: u32, gid: u32, parent: Ino) -> Self {
        let now = Utc::now().timestamp();
        Self {
            kind,
            mode,
            uid,
            gid,
            nlink: if kind == FileKind::Directory { 2 } else { 1 },
            length: 0,
            parent,
            mtime: now,
            ctime: now,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn touch(&mut self) {
        let now = Utc::now().timestamp();
        self.mtime = now;
        self.ctime = now;
    }

    /// Space this inode is accounted for.
    pub fn space(&self) -> i64 {
        match self.kind {
            FileKind::File => align4k(self.length),
            FileKind::Directory => align4k(0),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| MetaError::Invalid(format!("encode attr: {e}")))
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        serde_json::from_slice(buf).map_err(|_| MetaError::Corrupt {
            what: "inode attributes",
            len: buf.len(),
        })
    }
}

/// Directory entry value: kind tag followed by the inode.
pub fn encode_entry(kind: FileKind, ino: Ino) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.push(kind.tag());
    buf.extend_from_slice(&ino.to_be_bytes());
    buf
}

pub fn decode_entry(buf: &[u8]) -> Result<(FileKind, Ino)> {
    let corrupt = || MetaError::Corrupt {
        what: "directory entry",
        len: buf.len(),
    };
    if buf.len() != 9 {
        return Err(corrupt());
    }
    let kind = FileKind::from_tag(buf[0]).ok_or_else(corrupt)?;
    let mut ino = [0u8; 8];
    ino.copy_from_slice(&buf[1..9]);
    Ok((kind, Ino::from_be_bytes(ino)))
}

/// Space charged for `length` bytes: whole 4 KiB blocks, at least one.
pub fn align4k(length: u64) -> i64 {
    if length == 0 {
        return 1 << 12;
    }
    ((((length - 1) >> 12) + 1) << 12) as i64
}
