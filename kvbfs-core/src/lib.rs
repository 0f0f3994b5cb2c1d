pub mod blockio;
pub mod cache;
pub mod codec;
pub mod context;
pub mod dirops;
pub mod error;
pub mod events;
pub mod fsops;
pub mod model;
pub mod superblock;
pub mod version;
pub mod vtree;
pub mod xattr;

pub use cache::{CacheHandle, InodeCache};
pub use context::{Context, SemanticHook};
pub use error::{CoreError, CoreResult};
pub use fsops::{
    Handle, OpenFlags, AGENTFS_INO, AGENTFS_NAME, EVENTS_INO, EVENTS_NAME, VERSIONS_NAME,
};
pub use model::{DirEntry, EntryKind, Inode, SetAttr, Timestamp, BLOCK_SIZE, ROOT_INO};
pub use superblock::{open_or_init, IdAllocator};
