//! Translates `fuser`'s lowlevel FUSE callbacks into `kvbfs_core::fsops`
//! calls. One `Inner` is shared (via `Arc`) between the `Filesystem` impl
//! and the mount binary, so the binary can hand the background session's
//! `Notifier` back in once `spawn_mount2` returns it.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyIoctl, ReplyOpen, ReplyPoll, ReplyStatfs,
    ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use kvbfs_core::{
    events, fsops, Context, CoreError, EntryKind, Handle, Inode, OpenFlags, SetAttr, Timestamp,
    AGENTFS_INO, EVENTS_INO, ROOT_INO,
};
use parking_lot::Mutex;

const TTL: Duration = Duration::from_secs(1);

fn errno(err: &CoreError) -> i32 {
    match err {
        CoreError::NotFound => libc::ENOENT,
        CoreError::Exists => libc::EEXIST,
        CoreError::NotADirectory => libc::ENOTDIR,
        CoreError::IsADirectory => libc::EISDIR,
        CoreError::NotEmpty => libc::ENOTEMPTY,
        CoreError::PermissionDenied => libc::EPERM,
        CoreError::NameTooLong => libc::ENAMETOOLONG,
        CoreError::Io(_) => libc::EIO,
        CoreError::NoMemory => libc::ENOMEM,
        CoreError::InvalidArgument => libc::EINVAL,
        CoreError::NotSupported => libc::ENOTSUP,
        CoreError::NoAttr => libc::ENODATA,
    }
}

fn system_time(ts: Timestamp) -> SystemTime {
    if ts.secs >= 0 {
        UNIX_EPOCH + Duration::new(ts.secs as u64, ts.nanos)
    } else {
        UNIX_EPOCH - Duration::new((-ts.secs) as u64, 0)
    }
}

fn timestamp(t: SystemTime) -> Timestamp {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => Timestamp {
            secs: d.as_secs() as i64,
            nanos: d.subsec_nanos(),
        },
        Err(e) => Timestamp {
            secs: -(e.duration().as_secs() as i64),
            nanos: 0,
        },
    }
}

fn file_attr(inode: &Inode) -> FileAttr {
    let kind = if inode.is_dir() {
        FileType::Directory
    } else if inode.is_symlink() {
        FileType::Symlink
    } else {
        FileType::RegularFile
    };
    FileAttr {
        ino: inode.ino,
        size: inode.size,
        blocks: inode.blocks,
        atime: system_time(inode.atime),
        mtime: system_time(inode.mtime),
        ctime: system_time(inode.ctime),
        crtime: system_time(inode.ctime),
        kind,
        perm: inode.perm() as u16,
        nlink: inode.nlink,
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        rdev: 0,
        blksize: kvbfs_core::BLOCK_SIZE as u32,
        flags: 0,
    }
}

fn entry_kind_to_file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::Directory => FileType::Directory,
        EntryKind::Regular => FileType::RegularFile,
        EntryKind::Symlink => FileType::Symlink,
        EntryKind::Unknown => FileType::RegularFile,
    }
}

fn name_str(name: &OsStr) -> Result<&str, i32> {
    name.to_str().ok_or(libc::EINVAL)
}

/// Per-open state keyed by the opaque `fh` handed back to the kernel.
/// Directories and `.agentfs` carry no state of their own (they always
/// open with `fh = 0`); only regular files and the `.events` tail need one.
enum OpenHandle {
    File(Handle),
    Events(events::Reader),
}

struct Inner {
    ctx: Arc<Context>,
    handles: Mutex<HashMap<u64, OpenHandle>>,
    next_fh: AtomicU64,
    /// Last-seen parent for each inode, so `readdir`'s `..` entry can point
    /// somewhere meaningful. Best-effort: a hard-linked file has more than
    /// one real parent, and only the most recent lookup wins.
    parents: Mutex<HashMap<u64, u64>>,
    notifier: Mutex<Option<fuser::Notifier>>,
}

impl Inner {
    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    fn note_parent(&self, ino: u64, parent: u64) {
        self.parents.lock().insert(ino, parent);
    }

    fn parent_of(&self, ino: u64) -> u64 {
        self.parents.lock().get(&ino).copied().unwrap_or(ino)
    }
}

/// The `fuser::Filesystem` adapter. Cheap to clone (an `Arc` wrapper) so
/// the mount binary can keep a handle after moving one into `mount2`.
#[derive(Clone)]
pub struct KvbfsFs(Arc<Inner>);

impl KvbfsFs {
    pub fn new(ctx: Arc<Context>) -> Self {
        let mut parents = HashMap::new();
        parents.insert(ROOT_INO, ROOT_INO);
        Self(Arc::new(Inner {
            ctx,
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            parents: Mutex::new(parents),
            notifier: Mutex::new(None),
        }))
    }

    /// Install the session's notifier once the mount has started, so
    /// `poll` on `.events` can wake a waiting reader.
    pub fn set_notifier(&self, notifier: fuser::Notifier) {
        *self.0.notifier.lock() = Some(notifier);
    }
}

impl Filesystem for KvbfsFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), i32> {
        tracing::info!("kvbfs mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        if let Err(e) = self.0.ctx.cache.sync_all() {
            tracing::warn!(error = %e, "sync on unmount failed");
        }
        tracing::info!("kvbfs unmounted");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match fsops::lookup(&self.0.ctx, parent, name) {
            Ok((ino, attr)) => {
                self.0.note_parent(ino, parent);
                reply.entry(&TTL, &file_attr(&attr), 0)
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match fsops::getattr(&self.0.ctx, ino) {
            Ok(attr) => reply.attr(&TTL, &file_attr(&attr)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let mut attr = SetAttr {
            mode,
            size,
            ..Default::default()
        };
        match atime {
            Some(TimeOrNow::SpecificTime(t)) => attr.atime = Some(timestamp(t)),
            Some(TimeOrNow::Now) => attr.atime_now = true,
            None => {}
        }
        match mtime {
            Some(TimeOrNow::SpecificTime(t)) => attr.mtime = Some(timestamp(t)),
            Some(TimeOrNow::Now) => attr.mtime_now = true,
            None => {}
        }
        match fsops::setattr(&self.0.ctx, ino, &attr) {
            Ok(attr) => reply.attr(&TTL, &file_attr(&attr)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match fsops::readlink(&self.0.ctx, ino) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        if mode & kvbfs_core::model::S_IFMT != kvbfs_core::model::S_IFREG {
            return reply.error(libc::ENOSYS);
        }
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match fsops::create(&self.0.ctx, parent, name, mode) {
            Ok((handle, attr)) => {
                if let Err(e) = fsops::release(&self.0.ctx, handle) {
                    return reply.error(errno(&e));
                }
                self.0.note_parent(attr.ino, parent);
                reply.entry(&TTL, &file_attr(&attr), 0)
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match fsops::mkdir(&self.0.ctx, parent, name, mode) {
            Ok((ino, attr)) => {
                self.0.note_parent(ino, parent);
                reply.entry(&TTL, &file_attr(&attr), 0)
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match fsops::unlink(&self.0.ctx, parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match fsops::rmdir(&self.0.ctx, parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let target = match link.to_str() {
            Some(t) => t,
            None => return reply.error(libc::EINVAL),
        };
        match fsops::symlink(&self.0.ctx, parent, name, target) {
            Ok((ino, attr)) => {
                self.0.note_parent(ino, parent);
                reply.entry(&TTL, &file_attr(&attr), 0)
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let newname = match name_str(newname) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match fsops::rename(&self.0.ctx, parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let newname = match name_str(newname) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match fsops::link(&self.0.ctx, ino, newparent, newname) {
            Ok(attr) => {
                self.0.note_parent(ino, newparent);
                reply.entry(&TTL, &file_attr(&attr), 0)
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if ino == EVENTS_INO {
            let fh = self.0.alloc_fh();
            self.0
                .handles
                .lock()
                .insert(fh, OpenHandle::Events(self.0.ctx.events.open_reader()));
            return reply.opened(fh, 0);
        }
        if ino == AGENTFS_INO {
            return reply.opened(0, 0);
        }
        let open_flags = OpenFlags {
            truncate: flags & libc::O_TRUNC != 0,
        };
        match fsops::open(&self.0.ctx, ino, open_flags) {
            Ok(handle) => {
                let fh = self.0.alloc_fh();
                self.0.handles.lock().insert(fh, OpenHandle::File(handle));
                reply.opened(fh, 0)
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match fsops::create(&self.0.ctx, parent, name, mode) {
            Ok((handle, attr)) => {
                self.0.note_parent(attr.ino, parent);
                let fh = self.0.alloc_fh();
                self.0.handles.lock().insert(fh, OpenHandle::File(handle));
                reply.created(&TTL, &file_attr(&attr), 0, fh, 0)
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if ino == EVENTS_INO {
            let mut handles = self.0.handles.lock();
            return match handles.get_mut(&fh) {
                Some(OpenHandle::Events(reader)) => {
                    reply.data(&self.0.ctx.events.read(reader, size as usize))
                }
                _ => reply.error(libc::EBADF),
            };
        }
        if ino == AGENTFS_INO {
            return reply.error(libc::ENOTSUP);
        }
        let handles = self.0.handles.lock();
        let handle = match handles.get(&fh) {
            Some(OpenHandle::File(h)) => h,
            _ => return reply.error(libc::EBADF),
        };
        match fsops::read(&self.0.ctx, handle, offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if ino == EVENTS_INO || ino == AGENTFS_INO {
            return reply.error(libc::ENOTSUP);
        }
        let mut handles = self.0.handles.lock();
        let handle = match handles.get_mut(&fh) {
            Some(OpenHandle::File(h)) => h,
            _ => return reply.error(libc::EBADF),
        };
        match fsops::write(&self.0.ctx, handle, offset as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.0.handles.lock().remove(&fh) {
            Some(OpenHandle::File(handle)) => match fsops::release(&self.0.ctx, handle) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno(&e)),
            },
            Some(OpenHandle::Events(_)) | None => reply.ok(),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        if ino == EVENTS_INO || ino == AGENTFS_INO {
            return reply.ok();
        }
        match fsops::fsync(&self.0.ctx, ino) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match fsops::opendir(&self.0.ctx, ino) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let parent = self.0.parent_of(ino);
        match fsops::readdir(&self.0.ctx, ino, parent, offset as u64) {
            Ok(entries) => {
                for entry in entries {
                    let full = reply.add(
                        entry.ino,
                        entry.next_offset as i64,
                        entry_kind_to_file_type(entry.kind),
                        &entry.name,
                    );
                    if full {
                        break;
                    }
                }
                reply.ok()
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok()
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        reply.statfs(
            0,
            0,
            0,
            0,
            0,
            kvbfs_core::BLOCK_SIZE as u32,
            255,
            kvbfs_core::BLOCK_SIZE as u32,
        );
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let mode = if flags & libc::XATTR_CREATE != 0 {
            kvbfs_core::xattr::SetMode::CreateOnly
        } else if flags & libc::XATTR_REPLACE != 0 {
            kvbfs_core::xattr::SetMode::ReplaceOnly
        } else {
            kvbfs_core::xattr::SetMode::Any
        };
        match fsops::setxattr(&self.0.ctx, ino, name, value, mode) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match fsops::getxattr(&self.0.ctx, ino, name) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32)
                } else if value.len() > size as usize {
                    reply.error(libc::ERANGE)
                } else {
                    reply.data(&value)
                }
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match fsops::listxattr(&self.0.ctx, ino) {
            Ok(names) => {
                let mut buf = Vec::new();
                for name in names {
                    buf.extend_from_slice(name.as_bytes());
                    buf.push(0);
                }
                if size == 0 {
                    reply.size(buf.len() as u32)
                } else if buf.len() > size as usize {
                    reply.error(libc::ERANGE)
                } else {
                    reply.data(&buf)
                }
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match fsops::removexattr(&self.0.ctx, ino, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn poll(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        kh: u64,
        _events: u32,
        _flags: u32,
        reply: ReplyPoll,
    ) {
        if ino != EVENTS_INO {
            return reply.poll(libc::POLLIN as u32 | libc::POLLOUT as u32);
        }
        let handles = self.0.handles.lock();
        let has_data = matches!(
            handles.get(&fh),
            Some(OpenHandle::Events(reader)) if self.0.ctx.events.has_data(reader)
        );
        drop(handles);
        if has_data {
            return reply.poll(libc::POLLIN as u32);
        }
        let inner = self.0.clone();
        self.0.ctx.events.register_waiter(Box::new(move || {
            if let Some(notifier) = inner.notifier.lock().as_ref() {
                let _ = notifier.poll(kh);
            }
        }));
        reply.poll(0)
    }

    /// Narrowed control surface on `.agentfs`: query a path's version
    /// counter (`cmd = 1`, `in_data` an 8-byte little-endian ino, reply an
    /// 8-byte little-endian counter) or the event ring's head/tail/seq
    /// (`cmd = 2`, no input, reply 24 bytes of three little-endian u64s).
    #[allow(clippy::too_many_arguments)]
    fn ioctl(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: u32,
        cmd: u32,
        in_data: &[u8],
        _out_size: u32,
        reply: ReplyIoctl,
    ) {
        if ino != AGENTFS_INO {
            return reply.error(libc::ENOTTY);
        }
        match cmd {
            1 => {
                let Ok(bytes) = <[u8; 8]>::try_from(in_data) else {
                    return reply.error(libc::EINVAL);
                };
                match fsops::version_of(&self.0.ctx, u64::from_le_bytes(bytes)) {
                    Ok(ver) => reply.ioctl(0, &ver.to_le_bytes()),
                    Err(e) => reply.error(errno(&e)),
                }
            }
            2 => {
                let (head, tail, seq) = fsops::ring_stats(&self.0.ctx);
                let mut out = Vec::with_capacity(24);
                out.extend_from_slice(&head.to_le_bytes());
                out.extend_from_slice(&tail.to_le_bytes());
                out.extend_from_slice(&seq.to_le_bytes());
                reply.ioctl(0, &out)
            }
            _ => reply.error(libc::ENOTTY),
        }
    }
}
