//! Data model shared by every component: inodes, timestamps, file mode
//! bits, directory entries. Persisted forms are the `bincode`-encoded
//! `Inode`/`Superblock`/`VersionMeta` structs stored under the keys
//! `codec` formats; in-memory forms add no extra state beyond what the
//! inode cache wraps them in.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Root directory inode number, fixed for the lifetime of a filesystem.
pub const ROOT_INO: u64 = 1;

/// Fixed block size in bytes.
pub const BLOCK_SIZE: u64 = 4096;

/// Number of 512-byte units per logical block, for `st_blocks` reporting.
pub const BLOCKS_512_PER_BLOCK: u64 = BLOCK_SIZE / 512;

// POSIX mode type bits (S_IFMT family) — universal constants, not tied to
// any particular libc binding, so kvbfs-core carries no libc dependency.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// POSIX timestamp with nanosecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: d.as_secs() as i64,
            nanos: d.subsec_nanos(),
        }
    }

    pub const ZERO: Timestamp = Timestamp { secs: 0, nanos: 0 };
}

/// The persistent per-inode metadata record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inode {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub blocks: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
}

impl Inode {
    pub fn new_file(ino: u64, perm: u32) -> Self {
        let now = Timestamp::now();
        Self {
            ino,
            mode: S_IFREG | (perm & 0o7777),
            nlink: 1,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    pub fn new_dir(ino: u64, perm: u32, nlink: u32) -> Self {
        let now = Timestamp::now();
        Self {
            ino,
            mode: S_IFDIR | (perm & 0o7777),
            nlink,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    pub fn new_symlink(ino: u64, target_len: u64) -> Self {
        let now = Timestamp::now();
        Self {
            ino,
            mode: S_IFLNK | 0o777,
            nlink: 1,
            size: target_len,
            blocks: if target_len > 0 { 1 } else { 0 },
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn touch_mtime_ctime(&mut self) {
        let now = Timestamp::now();
        self.mtime = now;
        self.ctime = now;
    }

    pub fn touch_ctime(&mut self) {
        self.ctime = Timestamp::now();
    }

    pub fn block_count_for_size(size: u64) -> u64 {
        size.div_ceil(BLOCK_SIZE)
    }
}

/// File type as returned by directory enumeration, independent of the
/// FUSE/`fuser` `FileType` enum so `kvbfs-core` has no FUSE dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    Regular,
    Symlink,
    Unknown,
}

impl EntryKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => EntryKind::Directory,
            S_IFREG => EntryKind::Regular,
            S_IFLNK => EntryKind::Symlink,
            _ => EntryKind::Unknown,
        }
    }
}

/// One entry yielded by directory enumeration: `.` and `..` are
/// synthesised at offsets 0 and 1, real dirents follow.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    pub name: String,
    pub kind: EntryKind,
    /// Offset to resume enumeration from on the *next* call.
    pub next_offset: u64,
}

/// Attribute changes accepted by `setattr`.
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<Timestamp>,
    pub mtime: Option<Timestamp>,
    pub atime_now: bool,
    pub mtime_now: bool,
}
