//! Storage errors.
//!
//! Everything here is fatal for the current operation: it is returned
//! and propagated, never swallowed. Expected outcomes (a lock that is
//! held elsewhere, a node that no longer exists) are plain return
//! values instead.

use hiercache_kernel::KernelError;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// SQLite rejected a statement or the connection failed.
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    /// Creating, deleting or inspecting the store file failed.
    #[error("store io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Node payloads or filters failed to (de)serialize.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// A stored value did not decode into a kernel type.
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// A thread panicked while holding the connection or hot cache.
    #[error("cache state poisoned: {0}")]
    Poisoned(&'static str),

    /// A lock stamp could not be written for a level that should exist.
    #[error("failed to lock hierarchy level: {0}")]
    LockFailed(String),

    /// The store file has no usable schema.
    #[error("schema error: {0}")]
    Schema(String),

    /// Stored rows contradict each other.
    #[error("inconsistent cache state: {0}")]
    Inconsistent(String),

    /// Configuration could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

impl CacheError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
