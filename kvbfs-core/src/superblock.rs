//! Superblock: magic, format version, and the monotonic inode-ID
//! allocator. Loaded once at mount; if absent the system initializes it
//! and synthesises the root directory inode.

use std::sync::Arc;

use kvbfs_kv::KvStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::codec;
use crate::error::CoreResult;
use crate::model::{Inode, ROOT_INO};

pub const MAGIC: u32 = 0x4B56_4246; // "KVBF"
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Superblock {
    pub magic: u32,
    pub version: u32,
    pub next_ino: u64,
}

/// Mints new inode identifiers from the superblock counter.
///
/// The mutex protects only the in-memory increment; the persist happens
/// after it is released, so a crash between increment and persist can
/// lose at most one identifier — never reuse one.
pub struct IdAllocator {
    kv: Arc<dyn KvStore>,
    next_ino: Mutex<u64>,
}

impl IdAllocator {
    fn new(kv: Arc<dyn KvStore>, next_ino: u64) -> Self {
        Self {
            kv,
            next_ino: Mutex::new(next_ino),
        }
    }

    pub fn alloc(&self) -> u64 {
        let (ino, to_persist) = {
            let mut next = self.next_ino.lock();
            let ino = *next;
            *next += 1;
            (ino, *next)
        };
        let sb = Superblock {
            magic: MAGIC,
            version: FORMAT_VERSION,
            next_ino: to_persist,
        };
        if let Err(e) = save(&self.kv, &sb) {
            warn!(error = %e, "failed to persist superblock after inode allocation");
        }
        ino
    }

    pub fn peek_next(&self) -> u64 {
        *self.next_ino.lock()
    }
}

fn save(kv: &Arc<dyn KvStore>, sb: &Superblock) -> CoreResult<()> {
    let bytes = bincode::serialize(sb).expect("superblock serialization is infallible");
    kv.put(&codec::superblock_key(), &bytes)?;
    Ok(())
}

fn load(kv: &Arc<dyn KvStore>) -> CoreResult<Option<Superblock>> {
    match kv.get(&codec::superblock_key())? {
        Some(bytes) => {
            let sb: Superblock =
                bincode::deserialize(&bytes).map_err(|_| crate::error::CoreError::Io(
                    kvbfs_kv::KvError::Protocol("corrupt superblock record".into()),
                ))?;
            Ok(Some(sb))
        }
        None => Ok(None),
    }
}

/// Load the superblock, or bootstrap a fresh one plus the root directory
/// inode if none is present. Returns the ready-to-use allocator.
pub fn open_or_init(kv: Arc<dyn KvStore>) -> CoreResult<IdAllocator> {
    match load(&kv)? {
        Some(sb) => {
            info!(next_ino = sb.next_ino, "loaded existing superblock");
            Ok(IdAllocator::new(kv, sb.next_ino))
        }
        None => {
            info!("no superblock found, bootstrapping fresh filesystem");
            let root = Inode::new_dir(ROOT_INO, 0o755, 2);
            let root_bytes = bincode::serialize(&root).expect("inode serialization is infallible");
            kv.put(&codec::inode_key(ROOT_INO)?, &root_bytes)?;
            let sb = Superblock {
                magic: MAGIC,
                version: FORMAT_VERSION,
                next_ino: ROOT_INO + 1,
            };
            save(&kv, &sb)?;
            Ok(IdAllocator::new(kv, sb.next_ino))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvbfs_kv::embedded::EmbeddedStore;

    #[test]
    fn bootstraps_root_on_first_open() {
        let kv: Arc<dyn KvStore> = Arc::new(EmbeddedStore::in_memory());
        let alloc = open_or_init(kv.clone()).unwrap();
        assert_eq!(alloc.peek_next(), 2);
        let root_bytes = kv.get(&codec::inode_key(ROOT_INO).unwrap()).unwrap().unwrap();
        let root: Inode = bincode::deserialize(&root_bytes).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.nlink, 2);
    }

    #[test]
    fn reload_preserves_counter() {
        let kv: Arc<dyn KvStore> = Arc::new(EmbeddedStore::in_memory());
        {
            let alloc = open_or_init(kv.clone()).unwrap();
            assert_eq!(alloc.alloc(), 2);
            assert_eq!(alloc.alloc(), 3);
        }
        let alloc = open_or_init(kv.clone()).unwrap();
        assert_eq!(alloc.alloc(), 4);
    }
}
