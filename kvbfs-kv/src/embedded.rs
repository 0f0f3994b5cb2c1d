//! In-process embedded KV engine.
//!
//! Backed by an ordered `BTreeMap` so prefix iteration is a cheap `range`
//! scan. Optionally mirrors its state to a flat file: loaded eagerly on
//! open, rewritten whole on `flush`. This gives `kvbfsd` restarts
//! continuity without claiming the crash-consistency this spec
//! explicitly excludes — a flush that is interrupted mid-write simply
//! leaves the previous snapshot in place, since the new file is written
//! to a temp path and renamed into place only once complete.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::{KvError, KvIterator, KvResult, KvStore};

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

pub struct EmbeddedStore {
    map: RwLock<Map>,
    mirror_path: Option<PathBuf>,
}

impl EmbeddedStore {
    /// A purely in-memory store with no on-disk mirror.
    pub fn in_memory() -> Self {
        Self {
            map: RwLock::new(Map::new()),
            mirror_path: None,
        }
    }

    /// Open (or create) a store mirrored at `path`. Existing content is
    /// loaded eagerly; a missing file starts empty.
    pub fn open<P: AsRef<Path>>(path: P) -> KvResult<Self> {
        let path = path.as_ref().to_path_buf();
        let map = match fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => {
                bincode::deserialize(&bytes).map_err(|e| KvError::Protocol(e.to_string()))?
            }
            Ok(_) => Map::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(KvError::Io(e)),
        };
        Ok(Self {
            map: RwLock::new(map),
            mirror_path: Some(path),
        })
    }

    /// Rewrite the mirror file from the current in-memory state. No-op for
    /// a purely in-memory store.
    pub fn flush(&self) -> KvResult<()> {
        let Some(path) = &self.mirror_path else {
            return Ok(());
        };
        let snapshot = self.map.read();
        let bytes = bincode::serialize(&*snapshot).map_err(|e| KvError::Protocol(e.to_string()))?;
        drop(snapshot);
        let tmp = path.with_extension("tmp");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl KvStore for EmbeddedStore {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> KvResult<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn prefix_iter<'a>(&'a self, prefix: &[u8]) -> KvResult<Box<dyn KvIterator + 'a>> {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .map
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(VecIter { entries, pos: 0 }))
    }
}

impl Drop for EmbeddedStore {
    fn drop(&mut self) {
        if self.mirror_path.is_some() {
            if let Err(e) = self.flush() {
                tracing::warn!(error = %e, "embedded store flush on drop failed");
            }
        }
    }
}

struct VecIter {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
}

impl KvIterator for VecIter {
    fn valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    fn next(&mut self) {
        self.pos += 1;
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.pos].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.pos].1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_roundtrip() {
        let store = EmbeddedStore::in_memory();
        assert_eq!(store.get(b"k").unwrap(), None);
        store.put(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        store.delete(b"k").unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
        // idempotent delete of a missing key
        store.delete(b"k").unwrap();
    }

    #[test]
    fn prefix_iter_is_ordered_and_scoped() {
        let store = EmbeddedStore::in_memory();
        store.put(b"d:1:b", b"2").unwrap();
        store.put(b"d:1:a", b"1").unwrap();
        store.put(b"d:2:a", b"9").unwrap();

        let mut it = store.prefix_iter(b"d:1:").unwrap();
        let mut keys = Vec::new();
        while it.valid() {
            keys.push(it.key().to_vec());
            it.next();
        }
        assert_eq!(keys, vec![b"d:1:a".to_vec(), b"d:1:b".to_vec()]);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        {
            let store = EmbeddedStore::open(&path).unwrap();
            store.put(b"k", b"v").unwrap();
            store.flush().unwrap();
        }
        let store = EmbeddedStore::open(&path).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
