use hiercache_store::CacheError;

/// Errors that abort an update pass.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// A task referenced a connection with no registered cache.
    #[error("no hierarchy cache registered for connection `{connection_id}`")]
    MissingCache { connection_id: String },

    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A node provider could not build or count its nodes.
    #[error("node provider failed: {0}")]
    Provider(String),
}
