//! Key codec: a bijective mapping from logical objects to KV keys, sharing
//! one keyspace disambiguated by a one- or two-character type tag and
//! colon-separated decimal fields. Decimal fields are never zero-padded,
//! so a prefix scan for `d:<parent>:` reliably enumerates only that
//! parent's entries — the name follows the final colon.

use crate::error::CoreError;

/// Keys longer than this are rejected rather than silently truncated or
/// passed through to a backend with its own (possibly shorter) limit.
pub const MAX_KEY_LEN: usize = 512;

fn check_len(key: Vec<u8>) -> Result<Vec<u8>, CoreError> {
    if key.len() > MAX_KEY_LEN {
        Err(CoreError::NameTooLong)
    } else {
        Ok(key)
    }
}

pub fn superblock_key() -> Vec<u8> {
    b"sb".to_vec()
}

pub fn inode_key(ino: u64) -> Result<Vec<u8>, CoreError> {
    check_len(format!("i:{ino}").into_bytes())
}

pub fn dirent_key(parent: u64, name: &str) -> Result<Vec<u8>, CoreError> {
    check_len(format!("d:{parent}:{name}").into_bytes())
}

pub fn dirent_prefix(parent: u64) -> Vec<u8> {
    format!("d:{parent}:").into_bytes()
}

/// Recover `name` from a key produced by [`dirent_key`], given the known
/// prefix length for `parent`.
pub fn dirent_name_from_key(key: &[u8], parent: u64) -> Option<String> {
    let prefix = dirent_prefix(parent);
    key.strip_prefix(prefix.as_slice())
        .map(|rest| String::from_utf8_lossy(rest).into_owned())
}

pub fn block_key(ino: u64, block: u64) -> Result<Vec<u8>, CoreError> {
    check_len(format!("b:{ino}:{block}").into_bytes())
}

pub fn xattr_key(ino: u64, name: &str) -> Result<Vec<u8>, CoreError> {
    check_len(format!("x:{ino}:{name}").into_bytes())
}

pub fn xattr_prefix(ino: u64) -> Vec<u8> {
    format!("x:{ino}:").into_bytes()
}

pub fn xattr_name_from_key(key: &[u8], ino: u64) -> Option<String> {
    let prefix = xattr_prefix(ino);
    key.strip_prefix(prefix.as_slice())
        .map(|rest| String::from_utf8_lossy(rest).into_owned())
}

pub fn version_counter_key(ino: u64) -> Vec<u8> {
    format!("vc:{ino}").into_bytes()
}

pub fn version_meta_key(ino: u64, ver: u64) -> Result<Vec<u8>, CoreError> {
    check_len(format!("vm:{ino}:{ver}").into_bytes())
}

pub fn version_meta_prefix(ino: u64) -> Vec<u8> {
    format!("vm:{ino}:").into_bytes()
}

/// Recover the version number from a key produced by [`version_meta_key`].
pub fn version_from_meta_key(key: &[u8], ino: u64) -> Option<u64> {
    let prefix = version_meta_prefix(ino);
    key.strip_prefix(prefix.as_slice())
        .and_then(|rest| std::str::from_utf8(rest).ok())
        .and_then(|s| s.parse().ok())
}

pub fn version_block_key(ino: u64, ver: u64, block: u64) -> Result<Vec<u8>, CoreError> {
    check_len(format!("vb:{ino}:{ver}:{block}").into_bytes())
}

pub fn version_block_prefix(ino: u64, ver: u64) -> Vec<u8> {
    format!("vb:{ino}:{ver}:").into_bytes()
}
