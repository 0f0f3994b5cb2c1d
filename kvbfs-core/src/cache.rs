//! Inode cache: an in-memory, refcounted cache with deferred delete. A
//! [`CacheHandle`]'s lifetime is the caller's exclusive right to read or
//! mutate the wrapped inode's in-memory copy; its `Drop` releases the
//! reference automatically, an ownership-based take on the classic
//! refcounted-hashtable-with-a-`deleted`-flag design.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use kvbfs_kv::KvStore;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

use crate::codec;
use crate::error::{CoreError, CoreResult};
use crate::model::Inode;

struct CacheEntry {
    inode: RwLock<Inode>,
    /// Outstanding [`CacheHandle`]s, distinct from the `Arc`'s own strong
    /// count (the map holds one of those too).
    refcount: AtomicU64,
    dirty: AtomicBool,
    deleted: AtomicBool,
    /// Runs once, exactly when this entry is actually reclaimed (deleted
    /// and the last handle has dropped). Lets callers tie block/xattr/
    /// version cleanup to the same deferred-delete point as the inode
    /// record itself, so a reader with a still-open handle never loses
    /// data it hasn't released yet.
    reclaim: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// The inode cache. Always held behind an `Arc` so [`CacheHandle`] can
/// release itself back into the map on drop.
pub struct InodeCache {
    kv: Arc<dyn KvStore>,
    map: Mutex<HashMap<u64, Arc<CacheEntry>>>,
}

impl InodeCache {
    pub fn new(kv: Arc<dyn KvStore>) -> Arc<Self> {
        Arc::new(Self {
            kv,
            map: Mutex::new(HashMap::new()),
        })
    }

    /// Acquire a handle to `ino`, loading it from the KV store on a cache
    /// miss. I/O happens with the map mutex released.
    pub fn acquire(self: &Arc<Self>, ino: u64) -> CoreResult<CacheHandle> {
        if let Some(entry) = self.try_adopt(ino) {
            return Ok(CacheHandle {
                cache: self.clone(),
                ino,
                entry,
            });
        }

        let key = codec::inode_key(ino)?;
        let bytes = self
            .kv
            .get(&key)?
            .ok_or(CoreError::NotFound)?;
        let inode: Inode = bincode::deserialize(&bytes)
            .map_err(|_| CoreError::Io(kvbfs_kv::KvError::Protocol("corrupt inode record".into())))?;
        let fresh = Arc::new(CacheEntry {
            inode: RwLock::new(inode),
            refcount: AtomicU64::new(1),
            dirty: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            reclaim: Mutex::new(None),
        });

        let mut map = self.map.lock();
        // Re-check under the lock: another thread may have raced us to load it.
        let winner = map
            .entry(ino)
            .and_modify(|existing| {
                if !existing.deleted.load(Ordering::Acquire) {
                    existing.refcount.fetch_add(1, Ordering::AcqRel);
                }
            })
            .or_insert_with(|| fresh.clone());
        let winner = winner.clone();
        drop(map);

        Ok(CacheHandle {
            cache: self.clone(),
            ino,
            entry: winner,
        })
    }

    fn try_adopt(&self, ino: u64) -> Option<Arc<CacheEntry>> {
        let map = self.map.lock();
        let entry = map.get(&ino)?;
        if entry.deleted.load(Ordering::Acquire) {
            return None;
        }
        entry.refcount.fetch_add(1, Ordering::AcqRel);
        Some(entry.clone())
    }

    /// Allocate and persist a brand-new inode, returning a handle with
    /// refcount 1.
    pub fn create(self: &Arc<Self>, inode: Inode) -> CoreResult<CacheHandle> {
        let ino = inode.ino;
        let key = codec::inode_key(ino)?;
        let bytes = bincode::serialize(&inode).expect("inode serialization is infallible");
        self.kv.put(&key, &bytes)?;

        let entry = Arc::new(CacheEntry {
            inode: RwLock::new(inode),
            refcount: AtomicU64::new(1),
            dirty: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            reclaim: Mutex::new(None),
        });
        self.map.lock().insert(ino, entry.clone());

        Ok(CacheHandle {
            cache: self.clone(),
            ino,
            entry,
        })
    }

    /// Mark `ino` deleted and remove its KV record. If no handle is
    /// outstanding, the entry is freed immediately; otherwise it is freed
    /// when the last handle releases.
    pub fn delete(&self, ino: u64) -> CoreResult<()> {
        self.delete_deferred(ino, || {})
    }

    /// Like [`Self::delete`], but `reclaim` runs exactly once, at the
    /// moment this entry is actually freed — immediately if no handle is
    /// outstanding, or when the last outstanding [`CacheHandle`] drops.
    /// Callers use this to tie block/xattr/version cleanup to the same
    /// point the inode record itself becomes unreachable, so a thread
    /// still holding a handle never observes data vanish out from under
    /// it.
    pub fn delete_deferred(&self, ino: u64, reclaim: impl FnOnce() + Send + 'static) -> CoreResult<()> {
        let key = codec::inode_key(ino)?;
        self.kv.delete(&key)?;

        let mut map = self.map.lock();
        match map.get(&ino) {
            Some(entry) => {
                entry.deleted.store(true, Ordering::Release);
                if entry.refcount.load(Ordering::Acquire) == 0 {
                    map.remove(&ino);
                    drop(map);
                    reclaim();
                } else {
                    *entry.reclaim.lock() = Some(Box::new(reclaim));
                }
            }
            None => {
                drop(map);
                reclaim();
            }
        }
        Ok(())
    }

    fn release(&self, ino: u64, entry: &Arc<CacheEntry>) {
        let remaining = entry.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && entry.deleted.load(Ordering::Acquire) {
            let mut map = self.map.lock();
            if let Some(current) = map.get(&ino) {
                if Arc::ptr_eq(current, entry) && current.refcount.load(Ordering::Acquire) == 0 {
                    map.remove(&ino);
                }
            }
            drop(map);
            if let Some(reclaim) = entry.reclaim.lock().take() {
                reclaim();
            }
        }
    }

    fn sync_entry(&self, ino: u64, entry: &CacheEntry) -> CoreResult<()> {
        if !entry.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        let bytes = {
            let guard = entry.inode.read();
            bincode::serialize(&*guard).expect("inode serialization is infallible")
        };
        let key = codec::inode_key(ino)?;
        self.kv.put(&key, &bytes)?;
        entry.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Sync every dirty cached inode to the KV store. Snapshots under the
    /// map mutex (bumping refcounts so entries can't vanish mid-sync),
    /// then does all I/O without holding it.
    pub fn sync_all(&self) -> CoreResult<()> {
        let snapshot: Vec<(u64, Arc<CacheEntry>)> = {
            let map = self.map.lock();
            map.iter()
                .filter(|(_, e)| e.dirty.load(Ordering::Acquire))
                .map(|(ino, e)| {
                    e.refcount.fetch_add(1, Ordering::AcqRel);
                    (*ino, e.clone())
                })
                .collect()
        };

        let mut first_err = None;
        for (ino, entry) in &snapshot {
            if let Err(e) = self.sync_entry(*ino, entry) {
                warn!(ino, error = %e, "inode sync failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        for (ino, entry) in &snapshot {
            self.release(*ino, entry);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tear down the cache at shutdown. Entries with outstanding handles
    /// are logged, not panicked on — the host dispatcher owns the
    /// lifetime of any handle it hasn't released yet.
    pub fn clear(&self) {
        let map = self.map.lock();
        for (ino, entry) in map.iter() {
            let rc = entry.refcount.load(Ordering::Acquire);
            if rc != 0 {
                warn!(ino, refcount = rc, "inode cache entry torn down with outstanding references");
            }
        }
    }
}

/// A live reference to a cached inode. Dropping it releases the
/// reference; it is never valid to read or mutate the inode without
/// holding one.
pub struct CacheHandle {
    cache: Arc<InodeCache>,
    ino: u64,
    entry: Arc<CacheEntry>,
}

impl CacheHandle {
    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Inode> {
        self.entry.inode.read()
    }

    /// Mutate the inode and mark it dirty. `f` should not perform KV I/O —
    /// the write lock is never to be held across I/O.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Inode) -> R) -> R {
        let mut guard: RwLockWriteGuard<'_, Inode> = self.entry.inode.write();
        let r = f(&mut guard);
        drop(guard);
        self.entry.dirty.store(true, Ordering::Release);
        r
    }

    /// Synchronously persist this inode if dirty.
    pub fn sync(&self) -> CoreResult<()> {
        self.cache.sync_entry(self.ino, &self.entry)
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.cache.release(self.ino, &self.entry);
    }
}
