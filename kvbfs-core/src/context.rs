//! Per-mount context: the subsystems every FS operation needs, bundled
//! into one object instead of a global, and constructed once at mount.

use std::sync::Arc;

use kvbfs_kv::KvStore;
use parking_lot::Mutex;

use crate::cache::InodeCache;
use crate::error::CoreResult;
use crate::events::EventRing;
use crate::superblock::{self, IdAllocator};
use crate::vtree::VTree;

/// Extension seam for a future semantic-indexing subsystem. Notified on
/// every write-release alongside the event ring, but `kvbfs-core` ships
/// with no implementation — see `original_source/src/llm.c`, which this
/// hook deliberately does not port.
pub trait SemanticHook: Send + Sync {
    fn on_write(&self, ino: u64);
}

pub struct Context {
    pub kv: Arc<dyn KvStore>,
    pub cache: Arc<InodeCache>,
    pub alloc: IdAllocator,
    pub vtree: VTree,
    pub events: EventRing,
    semantic_hook: Mutex<Option<Arc<dyn SemanticHook>>>,
}

impl Context {
    /// Open (or bootstrap) a filesystem over `kv`.
    pub fn open(kv: Arc<dyn KvStore>) -> CoreResult<Arc<Self>> {
        let alloc = superblock::open_or_init(kv.clone())?;
        let cache = InodeCache::new(kv.clone());
        Ok(Arc::new(Self {
            kv,
            cache,
            alloc,
            vtree: VTree::new(),
            events: EventRing::new(),
            semantic_hook: Mutex::new(None),
        }))
    }

    pub fn set_semantic_hook(&self, hook: Arc<dyn SemanticHook>) {
        *self.semantic_hook.lock() = Some(hook);
    }

    pub(crate) fn notify_write(&self, ino: u64) {
        if let Some(hook) = self.semantic_hook.lock().as_ref() {
            hook.on_write(ino);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvbfs_kv::embedded::EmbeddedStore;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn open_bootstraps_fresh_store() {
        let kv: Arc<dyn KvStore> = Arc::new(EmbeddedStore::in_memory());
        let ctx = Context::open(kv).unwrap();
        assert_eq!(ctx.alloc.peek_next(), 2);
    }

    #[test]
    fn semantic_hook_is_notified_on_demand() {
        let kv: Arc<dyn KvStore> = Arc::new(EmbeddedStore::in_memory());
        let ctx = Context::open(kv).unwrap();

        struct Counter(AtomicU64);
        impl SemanticHook for Counter {
            fn on_write(&self, _ino: u64) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let counter = Arc::new(Counter(AtomicU64::new(0)));
        ctx.set_semantic_hook(counter.clone());
        ctx.notify_write(5);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
