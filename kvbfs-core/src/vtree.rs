//! The synthetic `.versions` subtree: a read-only mirror of the real
//! directory tree where each file's leaf is replaced by one entry per
//! retained version. Virtual inode numbers are allocated lazily and
//! idempotently from a reserved high range, so the same (parent, name)
//! pair always yields the same virtual inode for the life of the mount.

use std::collections::HashMap;
use std::sync::Arc;

use kvbfs_kv::KvStore;
use parking_lot::Mutex;

use crate::cache::InodeCache;
use crate::dirops;
use crate::error::{CoreError, CoreResult};
use crate::model::{DirEntry, EntryKind, ROOT_INO};
use crate::version;

/// Fixed inode number for the `.versions` mount-root directory.
pub const VERSIONS_ROOT_INO: u64 = 0xFFFF_FFFF_FFFF_FFFD;

const VDIR_BASE: u64 = 0xC000_0000_0000_0001;
const VDIR_END: u64 = 0xD000_0000_0000_0000;

/// True iff `ino` falls in the reserved dynamic virtual-tree range.
pub fn is_vnode(ino: u64) -> bool {
    (VDIR_BASE..VDIR_END).contains(&ino)
}

#[derive(Debug, Clone, Copy)]
pub struct VNode {
    pub real_ino: u64,
    pub is_version_file: bool,
    pub version: u64,
}

struct State {
    by_ino: HashMap<u64, VNode>,
    by_parent: HashMap<(u64, String), u64>,
    next_vino: u64,
}

/// Per-mount virtual tree state. Purely in-memory: nothing here is
/// persisted, since it is all derivable from the real tree and the
/// version subsystem on demand.
pub struct VTree {
    state: Mutex<State>,
}

impl Default for VTree {
    fn default() -> Self {
        Self::new()
    }
}

impl VTree {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                by_ino: HashMap::new(),
                by_parent: HashMap::new(),
                next_vino: VDIR_BASE,
            }),
        }
    }

    fn alloc(&self, parent_vino: u64, name: &str, node: VNode) -> u64 {
        let mut state = self.state.lock();
        let key = (parent_vino, name.to_string());
        if let Some(&vino) = state.by_parent.get(&key) {
            return vino;
        }
        let vino = state.next_vino;
        state.next_vino += 1;
        state.by_ino.insert(vino, node);
        state.by_parent.insert(key, vino);
        vino
    }

    pub fn get(&self, vino: u64) -> Option<VNode> {
        self.state.lock().by_ino.get(&vino).copied()
    }

    /// Resolve one path component under `parent_vino` (which is either
    /// [`VERSIONS_ROOT_INO`] or another vnode), allocating a vnode for it
    /// if this is the first time it has been seen.
    pub fn resolve_child(
        &self,
        kv: &Arc<dyn KvStore>,
        cache: &Arc<InodeCache>,
        parent_vino: u64,
        name: &str,
    ) -> CoreResult<(u64, VNode)> {
        let parent_real = if parent_vino == VERSIONS_ROOT_INO {
            ROOT_INO
        } else {
            self.get(parent_vino).ok_or(CoreError::NotFound)?.real_ino
        };

        let parent_is_dir = cache.acquire(parent_real)?.read().is_dir();

        if parent_is_dir {
            let child_real = dirops::lookup(kv, parent_real, name)?.ok_or(CoreError::NotFound)?;
            let node = VNode {
                real_ino: child_real,
                is_version_file: false,
                version: 0,
            };
            Ok((self.alloc(parent_vino, name, node), node))
        } else {
            let displayed: u64 = name.parse().map_err(|_| CoreError::NotFound)?;
            if displayed == 0 {
                return Err(CoreError::NotFound);
            }
            let ver = displayed - 1;
            version::get_meta(kv, parent_real, ver)?.ok_or(CoreError::NotFound)?;
            let node = VNode {
                real_ino: parent_real,
                is_version_file: true,
                version: ver,
            };
            Ok((self.alloc(parent_vino, name, node), node))
        }
    }

    /// Enumerate one vnode directory's contents: either a mirrored real
    /// directory, or the version list of a mirrored file.
    pub fn readdir(
        &self,
        kv: &Arc<dyn KvStore>,
        cache: &Arc<InodeCache>,
        vino: u64,
        offset: u64,
    ) -> CoreResult<Vec<DirEntry>> {
        let real_ino = if vino == VERSIONS_ROOT_INO {
            ROOT_INO
        } else {
            self.get(vino).ok_or(CoreError::NotFound)?.real_ino
        };

        let mut out = Vec::new();
        let mut idx = 0u64;
        idx += 1;
        if idx > offset {
            out.push(DirEntry {
                ino: vino,
                name: ".".to_string(),
                kind: EntryKind::Directory,
                next_offset: idx,
            });
        }
        idx += 1;
        if idx > offset {
            out.push(DirEntry {
                ino: vino,
                name: "..".to_string(),
                kind: EntryKind::Directory,
                next_offset: idx,
            });
        }

        if cache.acquire(real_ino)?.read().is_dir() {
            for entry in dirops::readdir(kv, cache, real_ino, real_ino, 0)? {
                if entry.name == "." || entry.name == ".." {
                    continue;
                }
                idx += 1;
                if idx <= offset {
                    continue;
                }
                let cvino = self.alloc(
                    vino,
                    &entry.name,
                    VNode {
                        real_ino: entry.ino,
                        is_version_file: false,
                        version: 0,
                    },
                );
                out.push(DirEntry {
                    ino: cvino,
                    name: entry.name,
                    kind: EntryKind::Directory,
                    next_offset: idx,
                });
            }
        } else {
            for (ver, _meta) in version::list(kv, real_ino)? {
                idx += 1;
                if idx <= offset {
                    continue;
                }
                let display_name = (ver + 1).to_string();
                let cvino = self.alloc(
                    vino,
                    &display_name,
                    VNode {
                        real_ino,
                        is_version_file: true,
                        version: ver,
                    },
                );
                out.push(DirEntry {
                    ino: cvino,
                    name: display_name,
                    kind: EntryKind::Regular,
                    next_offset: idx,
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Inode, Timestamp};
    use kvbfs_kv::embedded::EmbeddedStore;

    fn setup() -> (Arc<dyn KvStore>, Arc<InodeCache>, VTree) {
        let kv: Arc<dyn KvStore> = Arc::new(EmbeddedStore::in_memory());
        let cache = InodeCache::new(kv.clone());
        cache.create(Inode::new_dir(ROOT_INO, 0o755, 2)).unwrap();
        (kv, cache, VTree::new())
    }

    #[test]
    fn resolving_same_path_twice_is_idempotent() {
        let (kv, cache, vt) = setup();
        cache.create(Inode::new_dir(2, 0o755, 2)).unwrap();
        dirops::add(&kv, ROOT_INO, "sub", 2).unwrap();

        let (vino1, _) = vt.resolve_child(&kv, &cache, VERSIONS_ROOT_INO, "sub").unwrap();
        let (vino2, _) = vt.resolve_child(&kv, &cache, VERSIONS_ROOT_INO, "sub").unwrap();
        assert_eq!(vino1, vino2);
        assert!(is_vnode(vino1));
    }

    #[test]
    fn resolving_version_number_past_retention_is_not_found() {
        let (kv, cache, vt) = setup();
        cache.create(Inode::new_file(2, 0o644)).unwrap();
        dirops::add(&kv, ROOT_INO, "f", 2).unwrap();
        crate::blockio::write(&kv, 2, 0, b"v1").unwrap();
        version::snapshot(&kv, 2, 2, 1, Timestamp::ZERO).unwrap();

        let (file_vino, _) = vt.resolve_child(&kv, &cache, VERSIONS_ROOT_INO, "f").unwrap();
        let (ver_vino, node) = vt.resolve_child(&kv, &cache, file_vino, "1").unwrap();
        assert!(node.is_version_file);
        assert!(is_vnode(ver_vino));
        assert!(matches!(
            vt.resolve_child(&kv, &cache, file_vino, "2"),
            Err(CoreError::NotFound)
        ));
    }

    #[test]
    fn readdir_on_versions_root_mirrors_real_root() {
        let (kv, cache, vt) = setup();
        cache.create(Inode::new_dir(2, 0o755, 2)).unwrap();
        dirops::add(&kv, ROOT_INO, "sub", 2).unwrap();

        let entries = vt.readdir(&kv, &cache, VERSIONS_ROOT_INO, 0).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "sub"]);
    }

    #[test]
    fn readdir_on_file_vnode_lists_versions_one_indexed() {
        let (kv, cache, vt) = setup();
        cache.create(Inode::new_file(2, 0o644)).unwrap();
        dirops::add(&kv, ROOT_INO, "f", 2).unwrap();
        crate::blockio::write(&kv, 2, 0, b"v1").unwrap();
        version::snapshot(&kv, 2, 2, 1, Timestamp::ZERO).unwrap();
        crate::blockio::write(&kv, 2, 0, b"v2").unwrap();
        version::snapshot(&kv, 2, 2, 1, Timestamp::ZERO).unwrap();

        let (file_vino, _) = vt.resolve_child(&kv, &cache, VERSIONS_ROOT_INO, "f").unwrap();
        let entries = vt.readdir(&kv, &cache, file_vino, 0).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "1", "2"]);
    }
}
