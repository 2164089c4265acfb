//! Multi-component ordering indexes.
//!
//! A data source is positioned inside its level by an index path, and
//! each node inside its data source by a local index path. The stored
//! form pads every component to a fixed width so that plain text
//! comparison orders indexes the same way as component-wise numeric
//! comparison, and a parent index sorts before everything that extends it.

use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use std::fmt;

const COMPONENT_WIDTH: usize = 20;
const SEPARATOR: char = '.';

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeIndex(Vec<u64>);

impl NodeIndex {
    pub fn new(components: Vec<u64>) -> Self {
        Self(components)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn components(&self) -> &[u64] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `self` followed by every component of `local`.
    pub fn concat(&self, local: &NodeIndex) -> NodeIndex {
        let mut components = self.0.clone();
        components.extend_from_slice(&local.0);
        Self(components)
    }

    pub fn to_storage_string(&self) -> String {
        let mut out = String::with_capacity(self.0.len() * (COMPONENT_WIDTH + 1));
        for (i, component) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(SEPARATOR);
            }
            out.push_str(&format!("{component:0width$}", width = COMPONENT_WIDTH));
        }
        out
    }

    pub fn from_storage_string(s: &str) -> Result<Self, KernelError> {
        if s.is_empty() {
            return Ok(Self::empty());
        }
        s.split(SEPARATOR)
            .map(|part| {
                part.parse::<u64>()
                    .map_err(|_| KernelError::InvalidIndex(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

/// Concatenate two stored index strings without decoding them.
pub fn concat_stored_indexes(prefix: &str, local: &str) -> String {
    match (prefix.is_empty(), local.is_empty()) {
        (true, _) => local.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{prefix}{SEPARATOR}{local}"),
    }
}

impl From<Vec<u64>> for NodeIndex {
    fn from(components: Vec<u64>) -> Self {
        Self(components)
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, component) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{component}")?;
        }
        write!(f, "]")
    }
}
