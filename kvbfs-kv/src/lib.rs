//! Ordered byte-keyed key-value abstraction.
//!
//! `kvbfs-core` is built entirely on the [`KvStore`] trait below; it never
//! knows whether it is talking to the in-process [`embedded::EmbeddedStore`]
//! or the [`net::NetworkStore`] client for the wire protocol in `net::wire`.
//! Both are point read/write/delete plus single-pass ascending prefix
//! iteration, with writes and deletes idempotent per key and no
//! cross-key atomicity assumed.

mod error;

pub mod embedded;
pub mod net;

pub use error::{KvError, KvResult};

/// A single-pass, ascending, prefix-matching cursor over a [`KvStore`].
///
/// Mirrors the C source's `valid`/`next`/`key`/`value` iterator shape: the
/// cursor lends references into its own buffer, so callers that need a key
/// or value past the next `next()` call must copy it out first.
pub trait KvIterator {
    fn valid(&self) -> bool;
    fn next(&mut self);
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
}

/// An ordered, byte-keyed key-value store.
///
/// Implementations must be safe to share across threads: `kvbfs-core`'s
/// worker threads call through a shared `Arc<dyn KvStore>` with no
/// external synchronization beyond what each method call does internally.
pub trait KvStore: Send + Sync {
    /// Point read. `Ok(None)` on miss, never an error.
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>>;

    /// Point write, overwriting any prior value. Idempotent.
    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()>;

    /// Point delete. Idempotent: deleting a missing key is a no-op success.
    fn delete(&self, key: &[u8]) -> KvResult<()>;

    /// Ascending-order iteration over every key with the given byte prefix.
    fn prefix_iter<'a>(&'a self, prefix: &[u8]) -> KvResult<Box<dyn KvIterator + 'a>>;

    /// Convenience: true iff at least one key carries `prefix`.
    fn prefix_is_empty(&self, prefix: &[u8]) -> KvResult<bool> {
        Ok(!self.prefix_iter(prefix)?.valid())
    }
}
