use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the function response cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file locking failed for {path}: {source}")]
    Locking {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{count} hash collisions for resource '{resource}'")]
    TooManyCollisions { resource: String, count: u64 },

    #[error("corrupt cache entry {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error(transparent)]
    Dap(#[from] tern_dap::DapError),
}
