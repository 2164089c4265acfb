//! Content hashes and hash paths.
//!
//! Every node key carries the chain of content hashes from the hierarchy
//! root down to itself. The chain identifies a node across rebuilds: ids
//! change when a level is regenerated, the hash path does not.

use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A SHA-256 digest over a node key's substantive fields, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    /// Hash raw bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(format!("{hash:x}"))
    }

    pub fn builder() -> ContentHashBuilder {
        ContentHashBuilder {
            hasher: Sha256::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Incremental hash builder.
///
/// Fields are fed in a fixed order; labels, extended data and ids never
/// take part.
pub struct ContentHashBuilder {
    hasher: Sha256,
}

impl ContentHashBuilder {
    pub fn field(mut self, name: &str, value: &str) -> Self {
        self.hasher.update(name.as_bytes());
        self.hasher.update(b":");
        self.hasher.update(value.as_bytes());
        self.hasher.update(b"\n");
        self
    }

    pub fn field_u64(self, name: &str, value: u64) -> Self {
        self.field(name, &value.to_string())
    }

    pub fn field_bool(self, name: &str, value: bool) -> Self {
        self.field(name, if value { "true" } else { "false" })
    }

    /// Skipped entirely when `None`.
    pub fn field_opt(self, name: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.field(name, v),
            None => self,
        }
    }

    pub fn finish(self) -> ContentHash {
        let hash = self.hasher.finalize();
        ContentHash(format!("{hash:x}"))
    }
}

/// Root-to-node chain of content hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashPath(Vec<ContentHash>);

const SEPARATOR: char = '/';

impl HashPath {
    /// The path of the (nodeless) hierarchy root.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Path of a node whose own hash is `hash`, placed under `self`.
    pub fn child(&self, hash: ContentHash) -> Self {
        let mut segments = self.0.clone();
        segments.push(hash);
        Self(segments)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn segments(&self) -> &[ContentHash] {
        &self.0
    }

    pub fn last(&self) -> Option<&ContentHash> {
        self.0.last()
    }

    /// The path without its last segment, or `None` at the root.
    pub fn parent(&self) -> Option<HashPath> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// True when `other` starts with every segment of `self` and is longer.
    pub fn is_strict_prefix_of(&self, other: &HashPath) -> bool {
        other.0.len() > self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// Encoded form stored in the `path_from_root` column.
    pub fn to_storage_string(&self) -> String {
        let mut out = String::new();
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(SEPARATOR);
            }
            out.push_str(segment.as_str());
        }
        out
    }

    pub fn from_storage_string(s: &str) -> Result<Self, KernelError> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for segment in s.split(SEPARATOR) {
            if segment.is_empty() {
                return Err(KernelError::InvalidHashPath(s.to_string()));
            }
            segments.push(ContentHash(segment.to_string()));
        }
        Ok(Self(segments))
    }
}

impl fmt::Display for HashPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_storage_string())
    }
}
