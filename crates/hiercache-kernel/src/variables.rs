//! Ruleset variables.
//!
//! A ruleset can be parameterized by user-settable variables. Data
//! sources remember only the variables they actually read, so a cached
//! data source stays valid for any variable set that agrees with it on
//! those entries.

use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Variable id to value. Ordered, so the serialized form is canonical.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RulesetVariables(BTreeMap<String, Value>);

impl RulesetVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(id.into(), value.into());
        self
    }

    pub fn set(&mut self, id: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(id.into(), value.into());
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.0.get(id)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// True when every entry of `other` is present here with an equal value.
    pub fn contains(&self, other: &RulesetVariables) -> bool {
        other
            .0
            .iter()
            .all(|(id, value)| self.0.get(id) == Some(value))
    }

    /// Keep only the entries whose ids appear in `ids`.
    pub fn restricted_to<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Self {
        let mut out = Self::new();
        for id in ids {
            if let Some(value) = self.0.get(id) {
                out.0.insert(id.to_string(), value.clone());
            }
        }
        out
    }

    pub fn to_storage_string(&self) -> String {
        // BTreeMap keys serialize in order and values are plain JSON.
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_storage_string(s: &str) -> Result<Self, KernelError> {
        if s.trim().is_empty() {
            return Ok(Self::new());
        }
        Ok(Self(serde_json::from_str(s)?))
    }
}

/// Whether a stored variable set satisfies a candidate.
///
/// In exact mode both sets must be equal. Otherwise the candidate must be
/// a superset of `required`: a data source that read `{a: 1}` matches any
/// candidate with `a == 1`, whatever else it holds.
pub fn variables_match(
    required: &RulesetVariables,
    candidate: &RulesetVariables,
    exact: bool,
) -> bool {
    if exact {
        required == candidate
    } else {
        candidate.contains(required)
    }
}
