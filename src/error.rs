use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Optimistic transaction lost a race at commit time.
    #[error("Transaction conflict on key {key}")]
    Conflict { key: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Quota exceeded for {0}")]
    QuotaExceeded(String),

    #[error("No space left: volume limit reached")]
    NoSpace,

    #[error("Corrupt {what}: unexpected length {len}")]
    Corrupt { what: &'static str, len: usize },

    #[error("Backend error: {message}")]
    Backend { message: String, retryable: bool },

    #[error("Operation cancelled")]
    Cancelled,

    /// A conflicting lock is held by another owner.
    #[error("Resource temporarily unavailable")]
    WouldBlock,

    #[error("Invalid argument: {0}")]
    Invalid(String),

    #[error("Operation not permitted")]
    NotPermitted,

    #[error("Metadata engine is read-only")]
    ReadOnly,

    #[error("Already exists: {0}")]
    Exists(String),

    #[error("Directory not empty")]
    NotEmpty,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MetaError {
    /// Whether the transaction harness may run the closure again.
    pub fn is_retryable(&self) -> bool {
        match self {
            MetaError::Conflict { .. } => true,
            MetaError::Backend { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Nearest POSIX errno for a filesystem front end.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            MetaError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            MetaError::Conflict { .. } => libc::EAGAIN,
            MetaError::NotFound(_) => libc::ENOENT,
            MetaError::QuotaExceeded(_) => libc::EDQUOT,
            MetaError::NoSpace => libc::ENOSPC,
            MetaError::Corrupt { .. } | MetaError::Backend { .. } => libc::EIO,
            MetaError::Cancelled => libc::EINTR,
            MetaError::WouldBlock => libc::EAGAIN,
            MetaError::Invalid(_) | MetaError::Config(_) => libc::EINVAL,
            MetaError::NotPermitted => libc::EPERM,
            MetaError::ReadOnly => libc::EROFS,
            MetaError::Exists(_) => libc::EEXIST,
            MetaError::NotEmpty => libc::ENOTEMPTY,
        }
    }
}

pub type Result<T> = std::result::Result<T, MetaError>;
