//! Error types for kernel value parsing.

/// Errors raised while decoding kernel values from their stored forms.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// A textual identifier is not a valid UUID.
    #[error("invalid {kind} id `{value}`: {source}")]
    InvalidId {
        kind: &'static str,
        value: String,
        #[source]
        source: uuid::Error,
    },

    /// A stored ordering index does not decode into integer components.
    #[error("invalid node index `{0}`")]
    InvalidIndex(String),

    /// A stored hash path has an empty segment.
    #[error("invalid hash path `{0}`")]
    InvalidHashPath(String),

    /// A stored node key type is unknown or its columns are inconsistent.
    #[error("invalid node key: {0}")]
    InvalidKey(String),

    /// Stored JSON (variables, filters, grouping values) failed to decode.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
