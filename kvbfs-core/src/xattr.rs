//! Extended attributes: user-set `name -> bytes` pairs under `x:<ino>:`,
//! plus a read-only `agentfs.*` namespace synthesized from the version
//! subsystem rather than stored.

use std::sync::Arc;

use kvbfs_kv::KvStore;
use serde::Serialize;

use crate::codec;
use crate::error::{CoreError, CoreResult};
use crate::version;

const VIRTUAL_PREFIX: &str = "agentfs.";

/// `setxattr`'s create/replace semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Any,
    CreateOnly,
    ReplaceOnly,
}

pub fn set(kv: &Arc<dyn KvStore>, ino: u64, name: &str, value: &[u8], mode: SetMode) -> CoreResult<()> {
    if name.starts_with(VIRTUAL_PREFIX) {
        return Err(CoreError::PermissionDenied);
    }
    let key = codec::xattr_key(ino, name)?;
    let exists = kv.get(&key)?.is_some();
    match mode {
        SetMode::CreateOnly if exists => return Err(CoreError::Exists),
        SetMode::ReplaceOnly if !exists => return Err(CoreError::NoAttr),
        _ => {}
    }
    kv.put(&key, value)?;
    Ok(())
}

#[derive(Serialize)]
struct VersionSummary {
    ver: u64,
    size: u64,
    mtime: i64,
}

/// Read `name`. Handles the virtual `agentfs.version`/`agentfs.versions`
/// attributes without touching the KV store beyond the version subsystem.
pub fn get(kv: &Arc<dyn KvStore>, ino: u64, name: &str) -> CoreResult<Vec<u8>> {
    if name == "agentfs.version" {
        return Ok(version::current(kv, ino)?.to_string().into_bytes());
    }
    if name == "agentfs.versions" {
        let summaries: Vec<VersionSummary> = version::list(kv, ino)?
            .into_iter()
            .map(|(ver, meta)| VersionSummary {
                ver,
                size: meta.size,
                mtime: meta.mtime.secs,
            })
            .collect();
        return Ok(serde_json::to_vec(&summaries).expect("version summary serialization is infallible"));
    }
    if name.starts_with(VIRTUAL_PREFIX) {
        return Err(CoreError::NoAttr);
    }

    let key = codec::xattr_key(ino, name)?;
    kv.get(&key)?.ok_or(CoreError::NoAttr)
}

/// List stored (non-virtual) attribute names.
pub fn list(kv: &Arc<dyn KvStore>, ino: u64) -> CoreResult<Vec<String>> {
    let prefix = codec::xattr_prefix(ino);
    let mut iter = kv.prefix_iter(&prefix)?;
    let mut names = Vec::new();
    while iter.valid() {
        if let Some(name) = codec::xattr_name_from_key(iter.key(), ino) {
            names.push(name);
        }
        iter.next();
    }
    Ok(names)
}

pub fn remove(kv: &Arc<dyn KvStore>, ino: u64, name: &str) -> CoreResult<()> {
    if name.starts_with(VIRTUAL_PREFIX) {
        return Err(CoreError::PermissionDenied);
    }
    let key = codec::xattr_key(ino, name)?;
    if kv.get(&key)?.is_none() {
        return Err(CoreError::NoAttr);
    }
    kv.delete(&key)?;
    Ok(())
}

/// Drop every stored attribute for `ino`, for unlink of the final link.
pub fn delete_all(kv: &Arc<dyn KvStore>, ino: u64) -> CoreResult<()> {
    let prefix = codec::xattr_prefix(ino);
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
