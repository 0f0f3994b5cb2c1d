use kvbfs_kv::KvError;

/// Error categories surfaced to the host dispatcher. Each variant maps to
/// exactly one POSIX errno category; the `fuser` adapter in `kvbfs-fuse`
/// is the only place that turns these into `c_int`.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    Exists,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("permission denied")]
    PermissionDenied,

    #[error("name too long")]
    NameTooLong,

    #[error("I/O error: {0}")]
    Io(#[from] KvError),

    #[error("out of memory")]
    NoMemory,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("not supported")]
    NotSupported,

    /// ENODATA — a missing extended attribute. Distinct from `NotFound`
    /// because `fuser` expects a different errno for the two cases.
    #[error("no attribute data")]
    NoAttr,
}

pub type CoreResult<T> = Result<T, CoreError>;
