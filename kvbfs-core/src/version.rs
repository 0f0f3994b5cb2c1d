//! Immutable version history: a snapshot is taken on release-of-last-writer,
//! retaining at most [`MAX_VERSIONS`] generations per inode with the
//! oldest pruned as new ones land.

use std::sync::Arc;

use kvbfs_kv::KvStore;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::CoreResult;
use crate::model::Timestamp;

pub const MAX_VERSIONS: u64 = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionMeta {
    pub size: u64,
    pub blocks: u64,
    pub mtime: Timestamp,
}

/// The next version number to be assigned; also the total number of
/// snapshots ever taken (`0` means none yet).
pub fn current(kv: &Arc<dyn KvStore>, ino: u64) -> CoreResult<u64> {
    match kv.get(&codec::version_counter_key(ino))? {
        Some(v) if v.len() == 8 => Ok(u64::from_le_bytes(v.try_into().unwrap())),
        _ => Ok(0),
    }
}

fn set_counter(kv: &Arc<dyn KvStore>, ino: u64, ver: u64) -> CoreResult<()> {
    kv.put(&codec::version_counter_key(ino), &ver.to_le_bytes())?;
    Ok(())
}

pub fn get_meta(kv: &Arc<dyn KvStore>, ino: u64, ver: u64) -> CoreResult<Option<VersionMeta>> {
    match kv.get(&codec::version_meta_key(ino, ver)?)? {
        Some(bytes) => {
            let meta = bincode::deserialize(&bytes).map_err(|_| {
                crate::error::CoreError::Io(kvbfs_kv::KvError::Protocol(
                    "corrupt version metadata record".into(),
                ))
            })?;
            Ok(Some(meta))
        }
        None => Ok(None),
    }
}

pub fn read_block(
    kv: &Arc<dyn KvStore>,
    ino: u64,
    ver: u64,
    block: u64,
) -> CoreResult<Option<Vec<u8>>> {
    Ok(kv.get(&codec::version_block_key(ino, ver, block)?)?)
}

fn delete_one(kv: &Arc<dyn KvStore>, ino: u64, ver: u64) -> CoreResult<()> {
    kv.delete(&codec::version_meta_key(ino, ver)?)?;
    let prefix = codec::version_block_prefix(ino, ver);
    let mut iter = kv.prefix_iter(&prefix)?;
    let mut keys = Vec::new();
    while iter.valid() {
        keys.push(iter.key().to_vec());
        iter.next();
    }
    drop(iter);
    for key in keys {
        kv.delete(&key)?;
    }
    Ok(())
}

/// Oldest version number still within the retention window for a counter
/// value of `ver` (versions are numbered `0..ver`).
fn retention_start(ver: u64) -> u64 {
    ver.saturating_sub(MAX_VERSIONS)
}

/// Snapshot `ino`'s current blocks under a new version number, skipping
/// empty files. Prunes the oldest retained version once the cap is
/// exceeded.
pub fn snapshot(
    kv: &Arc<dyn KvStore>,
    ino: u64,
    size: u64,
    blocks: u64,
    mtime: Timestamp,
) -> CoreResult<()> {
    if size == 0 {
        return Ok(());
    }
    let ver = current(kv, ino)?;

    for i in 0..blocks {
        if let Some(data) = kv.get(&codec::block_key(ino, i)?)? {
            kv.put(&codec::version_block_key(ino, ver, i)?, &data)?;
        }
    }

    let meta = VersionMeta { size, blocks, mtime };
    let bytes = bincode::serialize(&meta).expect("version metadata serialization is infallible");
    kv.put(&codec::version_meta_key(ino, ver)?, &bytes)?;
    set_counter(kv, ino, ver + 1)?;

    if ver + 1 > MAX_VERSIONS {
        let oldest = ver + 1 - MAX_VERSIONS;
        delete_one(kv, ino, oldest - 1)?;
    }
    Ok(())
}

/// List every retained version, oldest first.
pub fn list(kv: &Arc<dyn KvStore>, ino: u64) -> CoreResult<Vec<(u64, VersionMeta)>> {
    let ver = current(kv, ino)?;
    let start = retention_start(ver);
    let mut out = Vec::new();
    for v in start..ver {
        if let Some(meta) = get_meta(kv, ino, v)? {
            out.push((v, meta));
        }
    }
    Ok(out)
}

/// Drop every retained version of `ino`, for unlink of the final link.
pub fn delete_all(kv: &Arc<dyn KvStore>, ino: u64) -> CoreResult<()> {
    let ver = current(kv, ino)?;
    if ver == 0 {
        return Ok(());
    }
    kv.delete(&codec::version_counter_key(ino))?;
    let start = retention_start(ver);
    for v in start..ver {
        delete_one(kv, ino, v)?;
    }
    Ok(())
}
