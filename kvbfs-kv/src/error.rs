use std::io;

/// Errors a [`crate::KvStore`] backend can raise.
///
/// Point reads that miss are not an error — they return `Ok(None)` — this
/// enum is reserved for conditions the caller cannot recover from locally.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("key exceeds backend maximum length")]
    KeyTooLong,

    #[error("value exceeds backend maximum length")]
    ValueTooLong,

    #[error("backend I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("networked backend protocol error: {0}")]
    Protocol(String),

    #[error("networked backend returned status {0:#x}")]
    RemoteStatus(u16),
}

pub type KvResult<T> = Result<T, KvError>;
