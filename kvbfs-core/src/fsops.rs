//! The FS operation surface: every mutating/reading operation a host
//! dispatcher (FUSE or otherwise) needs, composed from `cache`, `dirops`,
//! `blockio`, `version`, `vtree`, `xattr` and `events` exactly the way
//! `fuse_ops.c` composes its own helpers.

use tracing::warn;

use crate::cache::CacheHandle;
use crate::context::Context;
use crate::error::{CoreError, CoreResult};
use crate::events::EventKind;
use crate::model::{DirEntry, Inode, SetAttr, Timestamp, ROOT_INO, S_IFDIR, S_IFREG};
use crate::{blockio, dirops, version, vtree, xattr};

/// Name of the synthetic mount-root entry that resolves to
/// [`vtree::VERSIONS_ROOT_INO`].
pub const VERSIONS_NAME: &str = ".versions";

/// Name and fixed inode of the read-only control file: supports the
/// narrowed `ioctl` surface (version-counter and ring-stats queries) but
/// carries no readable/writable content of its own.
pub const AGENTFS_NAME: &str = ".agentfs";
pub const AGENTFS_INO: u64 = 0xFFFF_FFFF_FFFF_FFFC;

/// Name and fixed inode of the event-ring tail file.
pub const EVENTS_NAME: &str = ".events";
pub const EVENTS_INO: u64 = 0xFFFF_FFFF_FFFF_FFFB;

fn agentfs_attr() -> Inode {
    let now = Timestamp::now();
    Inode {
        ino: AGENTFS_INO,
        mode: S_IFREG | 0o660,
        nlink: 1,
        size: 0,
        blocks: 0,
        atime: now,
        mtime: now,
        ctime: now,
    }
}

fn events_attr() -> Inode {
    let now = Timestamp::now();
    Inode {
        ino: EVENTS_INO,
        mode: S_IFREG | 0o440,
        nlink: 1,
        size: 0,
        blocks: 0,
        atime: now,
        mtime: now,
        ctime: now,
    }
}

/// Flags an `open` was called with, carried on [`Handle`] so `release` can
/// tell whether the open itself mutated the file (`O_TRUNC`).
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub truncate: bool,
}

/// Per-open file state: tracks whether any write landed during this open
/// so `release` knows whether to snapshot a new version, mirroring the
/// source's `struct kvbfs_fh`.
pub struct Handle {
    ino: u64,
    written: bool,
    cache_handle: CacheHandle,
}

impl Handle {
    pub fn ino(&self) -> u64 {
        self.ino
    }
}

fn versions_root_attr() -> Inode {
    let now = Timestamp::now();
    Inode {
        ino: vtree::VERSIONS_ROOT_INO,
        mode: S_IFDIR | 0o555,
        nlink: 2,
        size: 0,
        blocks: 0,
        atime: now,
        mtime: now,
        ctime: now,
    }
}

fn vnode_attr(ctx: &Context, node: vtree::VNode) -> CoreResult<Inode> {
    if node.is_version_file {
        let meta = version::get_meta(&ctx.kv, node.real_ino, node.version)?
            .ok_or(CoreError::NotFound)?;
        Ok(Inode {
            ino: 0,
            mode: S_IFREG | 0o444,
            nlink: 1,
            size: meta.size,
            blocks: meta.blocks,
            atime: meta.mtime,
            mtime: meta.mtime,
            ctime: meta.mtime,
        })
    } else {
        let real = ctx.cache.acquire(node.real_ino)?;
        let inode = real.read();
        Ok(Inode {
            ino: 0,
            mode: inode.mode,
            nlink: inode.nlink,
            size: inode.size,
            blocks: inode.blocks,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
        })
    }
}

/// Resolve one path component, handling the real tree and the synthetic
/// `.versions` subtree transparently.
pub fn lookup(ctx: &Context, parent: u64, name: &str) -> CoreResult<(u64, Inode)> {
    if parent == ROOT_INO && name == AGENTFS_NAME {
        return Ok((AGENTFS_INO, agentfs_attr()));
    }
    if parent == ROOT_INO && name == EVENTS_NAME {
        return Ok((EVENTS_INO, events_attr()));
    }
    if parent == ROOT_INO && name == VERSIONS_NAME {
        return Ok((vtree::VERSIONS_ROOT_INO, versions_root_attr()));
    }
    if parent == vtree::VERSIONS_ROOT_INO || vtree::is_vnode(parent) {
        let (vino, node) = ctx.vtree.resolve_child(&ctx.kv, &ctx.cache, parent, name)?;
        let mut attr = vnode_attr(ctx, node)?;
        attr.ino = vino;
        return Ok((vino, attr));
    }
    let child = dirops::lookup(&ctx.kv, parent, name)?.ok_or(CoreError::NotFound)?;
    let handle = ctx.cache.acquire(child)?;
    let attr = handle.read().clone();
    Ok((child, attr))
}

pub fn getattr(ctx: &Context, ino: u64) -> CoreResult<Inode> {
    if ino == AGENTFS_INO {
        return Ok(agentfs_attr());
    }
    if ino == EVENTS_INO {
        return Ok(events_attr());
    }
    if ino == vtree::VERSIONS_ROOT_INO {
        return Ok(versions_root_attr());
    }
    if vtree::is_vnode(ino) {
        let node = ctx.vtree.get(ino).ok_or(CoreError::NotFound)?;
        let mut attr = vnode_attr(ctx, node)?;
        attr.ino = ino;
        return Ok(attr);
    }
    Ok(ctx.cache.acquire(ino)?.read().clone())
}

/// Virtual inodes are read-only: requested changes are silently ignored
/// and the current (synthesized) attributes are returned, matching
/// `fuse_ops.c`'s virtual-stat branches.
pub fn setattr(ctx: &Context, ino: u64, attr: &SetAttr) -> CoreResult<Inode> {
    if ino == AGENTFS_INO || ino == EVENTS_INO || ino == vtree::VERSIONS_ROOT_INO || vtree::is_vnode(ino) {
        return getattr(ctx, ino);
    }
    let handle = ctx.cache.acquire(ino)?;
    let old_size = handle.read().size;
    if let Some(new_size) = attr.size {
        if new_size < old_size {
            blockio::truncate(&ctx.kv, ino, old_size, new_size)?;
        }
    }
    handle.mutate(|inode| {
        if let Some(mode) = attr.mode {
            inode.mode = (inode.mode & !0o7777) | (mode & 0o7777);
        }
        if let Some(size) = attr.size {
            inode.size = size;
            inode.blocks = Inode::block_count_for_size(size);
        }
        if let Some(atime) = attr.atime {
            inode.atime = atime;
        }
        if let Some(mtime) = attr.mtime {
            inode.mtime = mtime;
        }
        if attr.atime_now {
            inode.atime = Timestamp::now();
        }
        if attr.mtime_now {
            inode.mtime = Timestamp::now();
        }
        inode.touch_ctime();
    });
    handle.sync()?;
    ctx.events.emit(EventKind::Setattr, ino, "");
    let attr = handle.read().clone();
    Ok(attr)
}

pub fn opendir(ctx: &Context, ino: u64) -> CoreResult<()> {
    if ino == vtree::VERSIONS_ROOT_INO || vtree::is_vnode(ino) {
        return Ok(());
    }
    if !ctx.cache.acquire(ino)?.read().is_dir() {
        return Err(CoreError::NotADirectory);
    }
    Ok(())
}

pub fn readdir(ctx: &Context, ino: u64, parent: u64, offset: u64) -> CoreResult<Vec<DirEntry>> {
    if ino == vtree::VERSIONS_ROOT_INO || vtree::is_vnode(ino) {
        return ctx.vtree.readdir(&ctx.kv, &ctx.cache, ino, offset);
    }
    let mut out = dirops::readdir(&ctx.kv, &ctx.cache, ino, parent, offset)?;
    if ino == ROOT_INO {
        let base = dirops::readdir(&ctx.kv, &ctx.cache, ino, parent, 0)?.len() as u64;
        let synthetic = [
            (AGENTFS_INO, AGENTFS_NAME, crate::model::EntryKind::Regular),
            (EVENTS_INO, EVENTS_NAME, crate::model::EntryKind::Regular),
            (vtree::VERSIONS_ROOT_INO, VERSIONS_NAME, crate::model::EntryKind::Directory),
        ];
        for (i, (sino, sname, kind)) in synthetic.into_iter().enumerate() {
            let idx = base + i as u64 + 1;
            if idx > offset {
                out.push(DirEntry {
                    ino: sino,
                    name: sname.to_string(),
                    kind,
                    next_offset: idx,
                });
            }
        }
    }
    Ok(out)
}

/// `(head, tail, seq)` for the `.agentfs` control surface's ring-stats
/// query.
pub fn ring_stats(ctx: &Context) -> (u64, u64, u64) {
    ctx.events.stats()
}

/// Current version counter for `ino`, for the `.agentfs` control
/// surface's per-path version query.
pub fn version_of(ctx: &Context, ino: u64) -> CoreResult<u64> {
    version::current(&ctx.kv, ino)
}

pub fn mkdir(ctx: &Context, parent: u64, name: &str, mode: u32) -> CoreResult<(u64, Inode)> {
    let parent_handle = ctx.cache.acquire(parent)?;
    if !parent_handle.read().is_dir() {
        return Err(CoreError::NotADirectory);
    }
    if dirops::lookup(&ctx.kv, parent, name)?.is_some() {
        return Err(CoreError::Exists);
    }

    let ino = ctx.alloc.alloc();
    let handle = ctx.cache.create(Inode::new_dir(ino, mode, 2))?;
    if let Err(e) = dirops::add(&ctx.kv, parent, name, ino) {
        ctx.cache.delete(ino)?;
        return Err(e);
    }

    parent_handle.mutate(|i| i.nlink += 1);
    parent_handle.sync()?;

    ctx.events.emit(EventKind::Mkdir, ino, name);
    let attr = handle.read().clone();
    Ok((ino, attr))
}

pub fn rmdir(ctx: &Context, parent: u64, name: &str) -> CoreResult<()> {
    let child = dirops::lookup(&ctx.kv, parent, name)?.ok_or(CoreError::NotFound)?;
    let child_handle = ctx.cache.acquire(child)?;
    if !child_handle.read().is_dir() {
        return Err(CoreError::NotADirectory);
    }
    if !dirops::is_empty(&ctx.kv, child)? {
        return Err(CoreError::NotEmpty);
    }

    dirops::remove(&ctx.kv, parent, name)?;
    if let Ok(parent_handle) = ctx.cache.acquire(parent) {
        parent_handle.mutate(|i| {
            if i.nlink > 0 {
                i.nlink -= 1;
            }
        });
        parent_handle.sync()?;
    }

    drop(child_handle);
    let kv = ctx.kv.clone();
    ctx.cache.delete_deferred(child, move || {
        if let Err(e) = xattr::delete_all(&kv, child) {
            warn!(ino = child, error = %e, "failed to reclaim xattrs for removed directory");
        }
        if let Err(e) = version::delete_all(&kv, child) {
            warn!(ino = child, error = %e, "failed to reclaim version history for removed directory");
        }
    })?;

    ctx.events.emit(EventKind::Rmdir, child, name);
    Ok(())
}

pub fn create(ctx: &Context, parent: u64, name: &str, mode: u32) -> CoreResult<(Handle, Inode)> {
    let parent_handle = ctx.cache.acquire(parent)?;
    if !parent_handle.read().is_dir() {
        return Err(CoreError::NotADirectory);
    }
    if dirops::lookup(&ctx.kv, parent, name)?.is_some() {
        return Err(CoreError::Exists);
    }

    let ino = ctx.alloc.alloc();
    let cache_handle = ctx.cache.create(Inode::new_file(ino, mode))?;
    if let Err(e) = dirops::add(&ctx.kv, parent, name, ino) {
        ctx.cache.delete(ino)?;
        return Err(e);
    }

    let attr = cache_handle.read().clone();
    ctx.events.emit(EventKind::Create, ino, name);
    Ok((
        Handle {
            ino,
            written: false,
            cache_handle,
        },
        attr,
    ))
}

/// Open an existing regular file, honoring `O_TRUNC` the way
/// `fuse_ops.c`'s `kvbfs_open` does: truncate happens before the handle is
/// handed back, and counts as a write for version-snapshot purposes.
pub fn open(ctx: &Context, ino: u64, flags: OpenFlags) -> CoreResult<Handle> {
    let cache_handle = ctx.cache.acquire(ino)?;
    if !cache_handle.read().is_file() {
        return Err(CoreError::IsADirectory);
    }

    if flags.truncate {
        let old_size = cache_handle.read().size;
        if old_size > 0 {
            blockio::delete_all(&ctx.kv, ino, old_size)?;
        }
        cache_handle.mutate(|i| {
            i.size = 0;
            i.blocks = 0;
            i.touch_mtime_ctime();
        });
        cache_handle.sync()?;
    }

    Ok(Handle {
        ino,
        written: flags.truncate,
        cache_handle,
    })
}

pub fn read(ctx: &Context, handle: &Handle, offset: u64, size: usize) -> CoreResult<Vec<u8>> {
    let file_size = handle.cache_handle.read().size;
    let avail = (file_size.saturating_sub(offset) as usize).min(size);
    blockio::read(&ctx.kv, handle.ino, offset, avail)
}

pub fn write(ctx: &Context, handle: &mut Handle, offset: u64, data: &[u8]) -> CoreResult<usize> {
    let n = blockio::write(&ctx.kv, handle.ino, offset, data)?;
    let written_to = offset + n as u64;
    handle.cache_handle.mutate(|inode| {
        if written_to > inode.size {
            inode.size = written_to;
        }
        inode.blocks = Inode::block_count_for_size(inode.size);
        inode.touch_mtime_ctime();
    });
    handle.cache_handle.sync()?;
    handle.written = true;
    Ok(n)
}

/// Snapshot a new version if this open ever wrote, matching
/// `kvbfs_release`'s `fh->written` check.
pub fn release(ctx: &Context, handle: Handle) -> CoreResult<()> {
    if handle.written {
        let (size, blocks, mtime) = {
            let inode = handle.cache_handle.read();
            (inode.size, inode.blocks, inode.mtime)
        };
        version::snapshot(&ctx.kv, handle.ino, size, blocks, mtime)?;
        ctx.notify_write(handle.ino);
        ctx.events.emit(EventKind::Write, handle.ino, "");
    }
    Ok(())
}

pub fn unlink(ctx: &Context, parent: u64, name: &str) -> CoreResult<()> {
    let child = dirops::lookup(&ctx.kv, parent, name)?.ok_or(CoreError::NotFound)?;
    let handle = ctx.cache.acquire(child)?;
    if handle.read().is_dir() {
        return Err(CoreError::IsADirectory);
    }

    dirops::remove(&ctx.kv, parent, name)?;
    let (should_delete, size) = handle.mutate(|i| {
        if i.nlink > 0 {
            i.nlink -= 1;
        }
        (i.nlink == 0, i.size)
    });
    handle.sync()?;

    if should_delete {
        drop(handle);
        let kv = ctx.kv.clone();
        ctx.cache.delete_deferred(child, move || {
            if let Err(e) = blockio::delete_all(&kv, child, size) {
                warn!(ino = child, error = %e, "failed to reclaim blocks for unlinked file");
            }
            if let Err(e) = xattr::delete_all(&kv, child) {
                warn!(ino = child, error = %e, "failed to reclaim xattrs for unlinked file");
            }
            if let Err(e) = version::delete_all(&kv, child) {
                warn!(ino = child, error = %e, "failed to reclaim version history for unlinked file");
            }
        })?;
    }

    ctx.events.emit(EventKind::Unlink, child, name);
    Ok(())
}

pub fn rename(
    ctx: &Context,
    parent: u64,
    name: &str,
    newparent: u64,
    newname: &str,
) -> CoreResult<()> {
    let src_ino = dirops::lookup(&ctx.kv, parent, name)?.ok_or(CoreError::NotFound)?;

    if let Some(dst_ino) = dirops::lookup(&ctx.kv, newparent, newname)? {
        let dst_handle = ctx.cache.acquire(dst_ino)?;
        let (dst_is_dir, dst_size) = {
            let inode = dst_handle.read();
            (inode.is_dir(), inode.size)
        };
        if dst_is_dir && !dirops::is_empty(&ctx.kv, dst_ino)? {
            return Err(CoreError::NotEmpty);
        }

        dirops::remove(&ctx.kv, newparent, newname)?;
        if dst_is_dir {
            if let Ok(np) = ctx.cache.acquire(newparent) {
                np.mutate(|i| {
                    if i.nlink > 0 {
                        i.nlink -= 1;
                    }
                });
                np.sync()?;
            }
        }
        drop(dst_handle);
        let kv = ctx.kv.clone();
        ctx.cache.delete_deferred(dst_ino, move || {
            if !dst_is_dir {
                if let Err(e) = blockio::delete_all(&kv, dst_ino, dst_size) {
                    warn!(ino = dst_ino, error = %e, "failed to reclaim blocks for replaced rename target");
                }
            }
            if let Err(e) = xattr::delete_all(&kv, dst_ino) {
                warn!(ino = dst_ino, error = %e, "failed to reclaim xattrs for replaced rename target");
            }
            if let Err(e) = version::delete_all(&kv, dst_ino) {
                warn!(ino = dst_ino, error = %e, "failed to reclaim version history for replaced rename target");
            }
        })?;
    }

    let src_is_dir = ctx.cache.acquire(src_ino)?.read().is_dir();

    dirops::remove(&ctx.kv, parent, name)?;
    if let Err(e) = dirops::add(&ctx.kv, newparent, newname, src_ino) {
        let _ = dirops::add(&ctx.kv, parent, name, src_ino);
        return Err(e);
    }

    if src_is_dir && parent != newparent {
        if let Ok(old_parent) = ctx.cache.acquire(parent) {
            old_parent.mutate(|i| {
                if i.nlink > 0 {
                    i.nlink -= 1;
                }
            });
            old_parent.sync()?;
        }
        if let Ok(new_parent) = ctx.cache.acquire(newparent) {
            new_parent.mutate(|i| i.nlink += 1);
            new_parent.sync()?;
        }
    }

    ctx.events.emit(EventKind::Rename, src_ino, newname);
    Ok(())
}

pub fn symlink(ctx: &Context, parent: u64, name: &str, target: &str) -> CoreResult<(u64, Inode)> {
    if !ctx.cache.acquire(parent)?.read().is_dir() {
        return Err(CoreError::NotADirectory);
    }
    if dirops::lookup(&ctx.kv, parent, name)?.is_some() {
        return Err(CoreError::Exists);
    }

    let ino = ctx.alloc.alloc();
    blockio::write(&ctx.kv, ino, 0, target.as_bytes())?;
    let handle = ctx.cache.create(Inode::new_symlink(ino, target.len() as u64))?;
    if let Err(e) = dirops::add(&ctx.kv, parent, name, ino) {
        blockio::delete_all(&ctx.kv, ino, target.len() as u64)?;
        ctx.cache.delete(ino)?;
        return Err(e);
    }
    let attr = handle.read().clone();
    Ok((ino, attr))
}

pub fn readlink(ctx: &Context, ino: u64) -> CoreResult<String> {
    let handle = ctx.cache.acquire(ino)?;
    let size = {
        let inode = handle.read();
        if !inode.is_symlink() {
            return Err(CoreError::InvalidArgument);
        }
        inode.size
    };
    let bytes = blockio::read(&ctx.kv, ino, 0, size as usize)?;
    String::from_utf8(bytes)
        .map_err(|_| CoreError::Io(kvbfs_kv::KvError::Protocol("corrupt symlink target".into())))
}

pub fn link(ctx: &Context, ino: u64, newparent: u64, newname: &str) -> CoreResult<Inode> {
    let handle = ctx.cache.acquire(ino)?;
    if handle.read().is_dir() {
        return Err(CoreError::PermissionDenied);
    }
    if !ctx.cache.acquire(newparent)?.read().is_dir() {
        return Err(CoreError::NotADirectory);
    }
    if dirops::lookup(&ctx.kv, newparent, newname)?.is_some() {
        return Err(CoreError::Exists);
    }

    dirops::add(&ctx.kv, newparent, newname, ino)?;
    handle.mutate(|i| {
        i.nlink += 1;
        i.touch_ctime();
    });
    handle.sync()?;

    ctx.events.emit(EventKind::Link, ino, newname);
    let attr = handle.read().clone();
    Ok(attr)
}

pub fn fsync(ctx: &Context, ino: u64) -> CoreResult<()> {
    ctx.cache.acquire(ino)?.sync()
}

pub fn setxattr(
    ctx: &Context,
    ino: u64,
    name: &str,
    value: &[u8],
    mode: xattr::SetMode,
) -> CoreResult<()> {
    xattr::set(&ctx.kv, ino, name, value, mode)?;
    ctx.events.emit(EventKind::Setxattr, ino, name);
    Ok(())
}

pub fn getxattr(ctx: &Context, ino: u64, name: &str) -> CoreResult<Vec<u8>> {
    xattr::get(&ctx.kv, ino, name)
}

pub fn listxattr(ctx: &Context, ino: u64) -> CoreResult<Vec<String>> {
    xattr::list(&ctx.kv, ino)
}

pub fn removexattr(ctx: &Context, ino: u64, name: &str) -> CoreResult<()> {
    xattr::remove(&ctx.kv, ino, name)?;
    ctx.events.emit(EventKind::Removexattr, ino, name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvbfs_kv::embedded::EmbeddedStore;
    use std::sync::Arc;

    fn ctx() -> Arc<Context> {
        let kv: Arc<dyn kvbfs_kv::KvStore> = Arc::new(EmbeddedStore::in_memory());
        Context::open(kv).unwrap()
    }

    #[test]
    fn create_write_release_snapshots_a_version() {
        let ctx = ctx();
        let (mut h, _attr) = create(&ctx, ROOT_INO, "f.txt", 0o644).unwrap();
        write(&ctx, &mut h, 0, b"hello").unwrap();
        release(&ctx, h).unwrap();

        assert_eq!(getxattr(&ctx, 2, "agentfs.version").unwrap(), b"1");
        let got = read(&ctx, &open(&ctx, 2, OpenFlags::default()).unwrap(), 0, 5).unwrap();
        assert_eq!(&got, b"hello");
    }

    #[test]
    fn release_without_write_takes_no_snapshot() {
        let ctx = ctx();
        let (h, _attr) = create(&ctx, ROOT_INO, "f.txt", 0o644).unwrap();
        release(&ctx, h).unwrap();
        assert_eq!(getxattr(&ctx, 2, "agentfs.version").unwrap(), b"0");
    }

    #[test]
    fn mkdir_then_rmdir_round_trips_root_nlink() {
        let ctx = ctx();
        assert_eq!(getattr(&ctx, ROOT_INO).unwrap().nlink, 2);
        let (dir_ino, attr) = mkdir(&ctx, ROOT_INO, "sub", 0o755).unwrap();
        assert_eq!(attr.nlink, 2);
        assert_eq!(getattr(&ctx, ROOT_INO).unwrap().nlink, 3);

        rmdir(&ctx, ROOT_INO, "sub").unwrap();
        assert_eq!(getattr(&ctx, ROOT_INO).unwrap().nlink, 2);
        assert!(matches!(getattr(&ctx, dir_ino), Err(CoreError::NotFound)));
    }

    #[test]
    fn rmdir_rejects_non_empty_directory() {
        let ctx = ctx();
        mkdir(&ctx, ROOT_INO, "sub", 0o755).unwrap();
        let (_, _) = create(&ctx, 2, "inner.txt", 0o644)
            .map(|(h, a)| (h.ino(), a))
            .unwrap();
        assert!(matches!(
            rmdir(&ctx, ROOT_INO, "sub"),
            Err(CoreError::NotEmpty)
        ));
    }

    #[test]
    fn unlink_final_link_frees_blocks_and_history() {
        let ctx = ctx();
        let (mut h, _) = create(&ctx, ROOT_INO, "f.txt", 0o644).unwrap();
        write(&ctx, &mut h, 0, b"data").unwrap();
        release(&ctx, h).unwrap();

        unlink(&ctx, ROOT_INO, "f.txt").unwrap();
        assert!(matches!(getattr(&ctx, 2), Err(CoreError::NotFound)));
        assert!(matches!(
            lookup(&ctx, ROOT_INO, "f.txt"),
            Err(CoreError::NotFound)
        ));
    }

    #[test]
    fn link_keeps_file_alive_until_last_name_removed() {
        let ctx = ctx();
        let (h, _) = create(&ctx, ROOT_INO, "a.txt", 0o644).unwrap();
        let ino = h.ino();
        release(&ctx, h).unwrap();

        link(&ctx, ino, ROOT_INO, "b.txt").unwrap();
        assert_eq!(getattr(&ctx, ino).unwrap().nlink, 2);

        unlink(&ctx, ROOT_INO, "a.txt").unwrap();
        assert!(getattr(&ctx, ino).is_ok());

        unlink(&ctx, ROOT_INO, "b.txt").unwrap();
        assert!(matches!(getattr(&ctx, ino), Err(CoreError::NotFound)));
    }

    #[test]
    fn rename_moves_across_directories_and_replaces_target() {
        let ctx = ctx();
        mkdir(&ctx, ROOT_INO, "dir_a", 0o755).unwrap();
        mkdir(&ctx, ROOT_INO, "dir_b", 0o755).unwrap();
        let (h, _) = create(&ctx, 2, "f.txt", 0o644).unwrap();
        let src_ino = h.ino();
        release(&ctx, h).unwrap();
        let (h2, _) = create(&ctx, 3, "f.txt", 0o644).unwrap();
        let old_dst_ino = h2.ino();
        release(&ctx, h2).unwrap();

        rename(&ctx, 2, "f.txt", 3, "f.txt").unwrap();

        assert!(matches!(lookup(&ctx, 2, "f.txt"), Err(CoreError::NotFound)));
        let (found, _) = lookup(&ctx, 3, "f.txt").unwrap();
        assert_eq!(found, src_ino);
        assert!(matches!(getattr(&ctx, old_dst_ino), Err(CoreError::NotFound)));
    }

    #[test]
    fn symlink_and_readlink_round_trip() {
        let ctx = ctx();
        let (ino, attr) = symlink(&ctx, ROOT_INO, "link", "/target/path").unwrap();
        assert!(attr.is_symlink());
        assert_eq!(readlink(&ctx, ino).unwrap(), "/target/path");
    }

    #[test]
    fn open_with_truncate_discards_existing_content_and_versions_it() {
        let ctx = ctx();
        let (mut h, _) = create(&ctx, ROOT_INO, "f.txt", 0o644).unwrap();
        write(&ctx, &mut h, 0, b"old content").unwrap();
        release(&ctx, h).unwrap();

        let h2 = open(&ctx, 2, OpenFlags { truncate: true }).unwrap();
        assert_eq!(getattr(&ctx, 2).unwrap().size, 0);
        release(&ctx, h2).unwrap();
        assert_eq!(getxattr(&ctx, 2, "agentfs.version").unwrap(), b"1");
    }

    #[test]
    fn setattr_mode_preserves_type_bits() {
        let ctx = ctx();
        let (h, _) = create(&ctx, ROOT_INO, "f.txt", 0o644).unwrap();
        let ino = h.ino();
        release(&ctx, h).unwrap();

        let attr = setattr(
            &ctx,
            ino,
            &SetAttr {
                mode: Some(0o600),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(attr.perm(), 0o600);
        assert!(attr.is_file());
    }

    #[test]
    fn lookup_versions_root_and_file_version_entries() {
        let ctx = ctx();
        let (mut h, _) = create(&ctx, ROOT_INO, "f.txt", 0o644).unwrap();
        write(&ctx, &mut h, 0, b"v1").unwrap();
        release(&ctx, h).unwrap();

        let (versions_ino, _) = lookup(&ctx, ROOT_INO, VERSIONS_NAME).unwrap();
        let (file_vino, _) = lookup(&ctx, versions_ino, "f.txt").unwrap();
        let (ver_vino, ver_attr) = lookup(&ctx, file_vino, "1").unwrap();
        assert!(vtree::is_vnode(ver_vino));
        assert_eq!(ver_attr.size, 2);
    }

    #[test]
    fn root_readdir_lists_control_surface_entries() {
        let ctx = ctx();
        mkdir(&ctx, ROOT_INO, "sub", 0o755).unwrap();

        let entries = readdir(&ctx, ROOT_INO, ROOT_INO, 0).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec![".", "..", "sub", AGENTFS_NAME, EVENTS_NAME, VERSIONS_NAME]
        );
    }

    #[test]
    fn agentfs_and_events_resolve_under_root() {
        let ctx = ctx();
        let (ino, attr) = lookup(&ctx, ROOT_INO, AGENTFS_NAME).unwrap();
        assert_eq!(ino, AGENTFS_INO);
        assert_eq!(attr.perm(), 0o660);

        let (ino, attr) = lookup(&ctx, ROOT_INO, EVENTS_NAME).unwrap();
        assert_eq!(ino, EVENTS_INO);
        assert_eq!(attr.perm(), 0o440);

        let (mut h, _) = create(&ctx, ROOT_INO, "f.txt", 0o644).unwrap();
        let ino = h.ino();
        write(&ctx, &mut h, 0, b"x").unwrap();
        release(&ctx, h).unwrap();
        assert_eq!(version_of(&ctx, ino).unwrap(), 1);

        let (head, tail, seq) = ring_stats(&ctx);
        assert!(seq > 0);
        assert!(tail <= head);
    }

    #[test]
    fn xattr_operations_round_trip_through_fsops() {
        let ctx = ctx();
        let (h, _) = create(&ctx, ROOT_INO, "f.txt", 0o644).unwrap();
        let ino = h.ino();
        release(&ctx, h).unwrap();

        setxattr(&ctx, ino, "user.tag", b"v", xattr::SetMode::Any).unwrap();
        assert_eq!(getxattr(&ctx, ino, "user.tag").unwrap(), b"v");
        assert_eq!(listxattr(&ctx, ino).unwrap(), vec!["user.tag".to_string()]);
        removexattr(&ctx, ino, "user.tag").unwrap();
        assert!(matches!(
            getxattr(&ctx, ino, "user.tag"),
            Err(CoreError::NoAttr)
        ));
    }
}
