//! Directory operations: the `d:<parent>:<name> -> child_ino` mapping,
//! plus readdir enumeration with synthesized `.`/`..` entries and a
//! resumable offset cursor.

use std::sync::Arc;

use kvbfs_kv::KvStore;

use crate::cache::InodeCache;
use crate::codec;
use crate::error::{CoreError, CoreResult};
use crate::model::{DirEntry, EntryKind};

fn decode_child(value: &[u8]) -> CoreResult<u64> {
    let bytes: [u8; 8] = value
        .try_into()
        .map_err(|_| CoreError::Io(kvbfs_kv::KvError::Protocol("corrupt dirent record".into())))?;
    Ok(u64::from_le_bytes(bytes))
}

/// Resolve `name` within `parent`. `Ok(None)` on a plain miss.
pub fn lookup(kv: &Arc<dyn KvStore>, parent: u64, name: &str) -> CoreResult<Option<u64>> {
    let key = codec::dirent_key(parent, name)?;
    match kv.get(&key)? {
        Some(v) => Ok(Some(decode_child(&v)?)),
        None => Ok(None),
    }
}

/// Link `name` to `child` under `parent`. Fails with [`CoreError::Exists`]
/// if the name is already taken.
pub fn add(kv: &Arc<dyn KvStore>, parent: u64, name: &str, child: u64) -> CoreResult<()> {
    let key = codec::dirent_key(parent, name)?;
    if kv.get(&key)?.is_some() {
        return Err(CoreError::Exists);
    }
    kv.put(&key, &child.to_le_bytes())?;
    Ok(())
}

/// Unlink `name` from `parent`. A no-op if the name is already gone.
pub fn remove(kv: &Arc<dyn KvStore>, parent: u64, name: &str) -> CoreResult<()> {
    let key = codec::dirent_key(parent, name)?;
    kv.delete(&key)?;
    Ok(())
}

/// True iff `ino` has no child dirents.
pub fn is_empty(kv: &Arc<dyn KvStore>, ino: u64) -> CoreResult<bool> {
    Ok(kv.prefix_is_empty(&codec::dirent_prefix(ino))?)
}

/// Enumerate `ino`'s entries starting after `offset` (the `next_offset` of
/// the last entry returned by a previous call, or `0` to start from the
/// top). `.` and `..` are synthesized at cursor positions 1 and 2.
pub fn readdir(
    kv: &Arc<dyn KvStore>,
    cache: &Arc<InodeCache>,
    ino: u64,
    parent: u64,
    offset: u64,
) -> CoreResult<Vec<DirEntry>> {
    let mut out = Vec::new();
    let mut idx = 0u64;

    idx += 1;
    if idx > offset {
        out.push(DirEntry {
            ino,
            name: ".".to_string(),
            kind: EntryKind::Directory,
            next_offset: idx,
        });
    }
    idx += 1;
    if idx > offset {
        out.push(DirEntry {
            ino: parent,
            name: "..".to_string(),
            kind: EntryKind::Directory,
            next_offset: idx,
        });
    }

    let prefix = codec::dirent_prefix(ino);
    let mut iter = kv.prefix_iter(&prefix)?;
    while iter.valid() {
        idx += 1;
        if idx <= offset {
            iter.next();
            continue;
        }
        let name = codec::dirent_name_from_key(iter.key(), ino).unwrap_or_default();
        let child_ino = decode_child(iter.value())?;
        let kind = cache
            .acquire(child_ino)
            .map(|h| EntryKind::from_mode(h.read().mode))
            .unwrap_or(EntryKind::Unknown);
        out.push(DirEntry {
            ino: child_ino,
            name,
            kind,
            next_offset: idx,
        });
        iter.next();
    }
    Ok(out)
}
