use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use super::attr::{align4k, decode_entry, encode_entry, Attr, FileKind};
use super::{Ino, Meta};
use crate::context::Context;
use crate::error::{MetaError, Result};
use crate::kv::{keys, KvTxn};
use crate::quota::QuotaKind;

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub name: String,
    pub ino: Ino,
    pub kind: FileKind,
}

/// Usage of a subtree. The starting directory counts in `dirs` and `size`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub length: u64,
    pub size: i64,
    pub files: i64,
    pub dirs: i64,
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(MetaError::Invalid(format!("bad name {name:?}")));
    }
    Ok(())
}

pub(super) fn load_attr(tx: &mut dyn KvTxn, ino: Ino) -> Result<Attr> {
    match tx.get(&keys::inode(ino))? {
        Some(buf) => Attr::decode(&buf),
        None => Err(MetaError::NotFound(format!("inode {ino}"))),
    }
}

impl Meta {
    fn next_inode(&self, ctx: &Context) -> Result<Ino> {
        let v = self
            .txn
            .txn(ctx, |tx| tx.incr_by(&keys::counter(keys::NEXT_INODE), 1))?;
        Ok(v as Ino)
    }

    pub fn get_attr(&self, ctx: &Context, ino: Ino) -> Result<Attr> {
        self.txn.view(ctx, |tx| load_attr(tx, ino))
    }

    pub fn lookup(&self, ctx: &Context, parent: Ino, name: &str) -> Result<(Ino, Attr)> {
        self.txn.view(ctx, |tx| {
            let buf = tx
                .get(&keys::dentry(parent, name))?
                .ok_or_else(|| MetaError::NotFound(format!("{name} in {parent}")))?;
            let (_, ino) = decode_entry(&buf)?;
            Ok((ino, load_attr(tx, ino)?))
        })
    }

    pub fn readdir(&self, ctx: &Context, ino: Ino) -> Result<Vec<Entry>> {
        self.txn.view(ctx, |tx| read_entries(tx, ino))
    }

    pub fn mkdir(&self, ctx: &Context, parent: Ino, name: &str, mode: u16) -> Result<(Ino, Attr)> {
        self.create_node(ctx, parent, name, FileKind::Directory, mode)
    }

    pub fn create(&self, ctx: &Context, parent: Ino, name: &str, mode: u16) -> Result<(Ino, Attr)> {
        self.create_node(ctx, parent, name, FileKind::File, mode)
    }

    fn create_node(&self, ctx: &Context, parent: Ino, name: &str, kind: FileKind, mode: u16) -> Result<(Ino, Attr)> {
        check_name(name)?;
        let space = align4k(0);
        self.admit_quota(ctx, ctx.uid, ctx.gid, space, 1, parent)?;
        let ino = self.next_inode(ctx)?;
        let attr = Attr::new(kind, mode, ctx.uid, ctx.gid, parent);
        let value = attr.encode()?;
        self.txn.txn(ctx, |tx| {
            let mut pattr = load_attr(tx, parent)?;
            if !pattr.is_dir() {
                return Err(MetaError::Invalid(format!("inode {parent} is not a directory")));
            }
            let dentry = keys::dentry(parent, name);
            if tx.get(&dentry)?.is_some() {
                return Err(MetaError::Exists(name.to_string()));
            }
            if kind == FileKind::Directory {
                pattr.nlink += 1;
            }
            pattr.touch();
            tx.set(&keys::inode(parent), &pattr.encode()?);
            tx.set(&keys::inode(ino), &value);
            tx.set(&dentry, &encode_entry(kind, ino));
            Ok(())
        })?;
        if kind == FileKind::Directory {
            self.dir_parents.insert(ino, parent);
        }
        self.update_usage(ctx, parent, ctx.uid, ctx.gid, space, 1);
        debug!("created {:?} {} as {}/{}", kind, ino, parent, name);
        Ok((ino, attr))
    }

    /// Remove a file entry. A file left without links is queued for data
    /// deletion.
    pub fn unlink(&self, ctx: &Context, parent: Ino, name: &str) -> Result<()> {
        let (attr, orphaned) = self.txn.txn(ctx, |tx| {
            let dentry = keys::dentry(parent, name);
            let buf = tx
                .get(&dentry)?
                .ok_or_else(|| MetaError::NotFound(format!("{name} in {parent}")))?;
            let (kind, ino) = decode_entry(&buf)?;
            if kind == FileKind::Directory {
                return Err(MetaError::NotPermitted);
            }
            let mut pattr = load_attr(tx, parent)?;
            let mut attr = load_attr(tx, ino)?;
            pattr.touch();
            tx.set(&keys::inode(parent), &pattr.encode()?);
            tx.delete(&dentry);
            attr.nlink = attr.nlink.saturating_sub(1);
            let orphaned = attr.nlink == 0;
            if orphaned {
                tx.delete(&keys::inode(ino));
                tx.set(
                    &keys::delfile(ino, attr.length),
                    &Utc::now().timestamp().to_be_bytes(),
                );
            } else {
                attr.touch();
                tx.set(&keys::inode(ino), &attr.encode()?);
            }
            Ok((attr, orphaned.then_some(ino)))
        })?;
        if let Some(ino) = orphaned {
            self.update_usage(ctx, parent, attr.uid, attr.gid, -attr.space(), -1);
            debug!("file {} unlinked, {} bytes queued for deletion", ino, attr.length);
        }
        Ok(())
    }

    pub fn rmdir(&self, ctx: &Context, parent: Ino, name: &str) -> Result<()> {
        let (ino, attr) = self.txn.txn(ctx, |tx| {
            let dentry = keys::dentry(parent, name);
            let buf = tx
                .get(&dentry)?
                .ok_or_else(|| MetaError::NotFound(format!("{name} in {parent}")))?;
            let (kind, ino) = decode_entry(&buf)?;
            if kind != FileKind::Directory {
                return Err(MetaError::Invalid(format!("{name} is not a directory")));
            }
            if tx.exists(&keys::dentry_prefix(ino))? {
                return Err(MetaError::NotEmpty);
            }
            let attr = load_attr(tx, ino)?;
            let mut pattr = load_attr(tx, parent)?;
            pattr.nlink = pattr.nlink.saturating_sub(1);
            pattr.touch();
            tx.set(&keys::inode(parent), &pattr.encode()?);
            tx.delete(&dentry);
            tx.delete(&keys::inode(ino));
            tx.delete(&keys::quota(QuotaKind::Dir, ino));
            Ok((ino, attr))
        })?;
        if self.quotas.remove(QuotaKind::Dir, ino).is_some() {
            info!("Quota of removed directory {} dropped", ino);
        }
        self.dir_parents.remove(&ino);
        self.update_usage(ctx, parent, attr.uid, attr.gid, -attr.space(), -1);
        Ok(())
    }

    /// Walk the subtree under `ino`. Each directory is read in its own view,
    /// and the walk stops as soon as `ctx` is cancelled.
    pub fn summary(&self, ctx: &Context, ino: Ino) -> Result<Summary> {
        self.walk(ctx, ino, false)
    }

    /// Like [`Meta::summary`], but the contents of subdirectories carrying
    /// their own dir quota are left out. The subdirectory itself is counted.
    pub(super) fn quota_summary(&self, ctx: &Context, ino: Ino) -> Result<Summary> {
        self.walk(ctx, ino, true)
    }

    fn walk(&self, ctx: &Context, ino: Ino, stop_at_quotas: bool) -> Result<Summary> {
        let root = self.get_attr(ctx, ino)?;
        let mut sum = Summary::default();
        account(&mut sum, &root);
        if !root.is_dir() {
            return Ok(sum);
        }
        let mut pending = vec![ino];
        while let Some(dir) = pending.pop() {
            ctx.check()?;
            let children = self.txn.view(ctx, |tx| {
                let entries = read_entries(tx, dir)?;
                let attr_keys: Vec<_> = entries.iter().map(|e| keys::inode(e.ino)).collect();
                let attrs = tx.batch_get(&attr_keys)?;
                let mut out = Vec::with_capacity(entries.len());
                for (e, buf) in entries.into_iter().zip(attrs) {
                    let Some(buf) = buf else {
                        debug!("entry {} of {} vanished", e.name, dir);
                        continue;
                    };
                    let attr = Attr::decode(&buf)?;
                    let fenced = stop_at_quotas
                        && attr.is_dir()
                        && tx.get(&keys::quota(QuotaKind::Dir, e.ino))?.is_some();
                    out.push((e.ino, attr, fenced));
                }
                Ok(out)
            })?;
            for (child, attr, fenced) in children {
                account(&mut sum, &attr);
                if attr.is_dir() && !fenced {
                    pending.push(child);
                }
            }
        }
        Ok(sum)
    }

    /// Space and inodes charged to one user or group across the volume.
    pub(super) fn owner_usage(&self, ctx: &Context, uid: Option<u32>, gid: Option<u32>) -> Result<(i64, i64)> {
        self.txn.view(ctx, |tx| {
            let mut usage = (0, 0);
            for (key, value) in tx.scan_prefix(b"A")? {
                if key.len() != 10 || key[9] != b'I' {
                    continue;
                }
                ctx.check()?;
                let attr = Attr::decode(&value)?;
                if uid.is_some_and(|u| u != attr.uid) || gid.is_some_and(|g| g != attr.gid) {
                    continue;
                }
                usage.0 += attr.space();
                usage.1 += 1;
            }
            Ok(usage)
        })
    }
}

fn account(sum: &mut Summary, attr: &Attr) {
    sum.size += attr.space();
    if attr.is_dir() {
        sum.dirs += 1;
    } else {
        sum.files += 1;
        sum.length += attr.length;
    }
}

fn read_entries(tx: &mut dyn KvTxn, ino: Ino) -> Result<Vec<Entry>> {
    let prefix = keys::dentry_prefix(ino);
    let mut out = Vec::new();
    for (key, value) in tx.scan_prefix(&prefix)? {
        let (kind, child) = decode_entry(&value)?;
        out.push(Entry {
            name: String::from_utf8_lossy(&key[prefix.len()..]).into_owned(),
            ino: child,
            kind,
        });
    }
    Ok(out)
}
