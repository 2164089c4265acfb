//! What an update pass reports, and where it reports it.

use hiercache_kernel::NavNode;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// An expanded child of a refreshed level and its new position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandedNodeUpdate {
    pub node: NavNode,
    pub position: usize,
}

/// One hierarchy level was rebuilt.
///
/// A record without `expanded_nodes` only carries the new count; hosts
/// reload the level. With them, hosts can keep expanded children open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyUpdateRecord {
    pub connection_id: String,
    pub ruleset_id: String,
    /// `None` for the root level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<NavNode>,
    pub nodes_count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expanded_nodes: Vec<ExpandedNodeUpdate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullUpdateKind {
    Hierarchy,
    Content,
    Both,
}

/// Everything shown for a ruleset must be reloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullUpdateRecord {
    pub ruleset_id: String,
    pub kind: FullUpdateKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum UpdateRecord {
    Hierarchy(HierarchyUpdateRecord),
    Full(FullUpdateRecord),
}

/// Receives the records of update passes. Every pass is bracketed by
/// `start` and `finish`.
pub trait UpdateRecordsSink: Send {
    fn start(&mut self) {}

    fn accept_hierarchy(&mut self, record: HierarchyUpdateRecord);

    fn accept_full(&mut self, record: FullUpdateRecord);

    fn finish(&mut self) {}
}

#[derive(Debug, Default)]
struct Collected {
    records: Vec<UpdateRecord>,
    passes: usize,
    open: bool,
}

/// A sink that keeps every record. Clones share the same storage, so a
/// host can hand one clone to the handler and read from another.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    inner: Arc<Mutex<Collected>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Collected) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn records(&self) -> Vec<UpdateRecord> {
        self.with(|c| c.records.clone())
    }

    /// Take the collected records, leaving the sink empty.
    pub fn drain(&self) -> Vec<UpdateRecord> {
        self.with(|c| std::mem::take(&mut c.records))
    }

    /// Completed passes.
    pub fn passes(&self) -> usize {
        self.with(|c| c.passes)
    }

    pub fn is_in_pass(&self) -> bool {
        self.with(|c| c.open)
    }
}

impl UpdateRecordsSink for CollectingSink {
    fn start(&mut self) {
        self.with(|c| c.open = true);
    }

    fn accept_hierarchy(&mut self, record: HierarchyUpdateRecord) {
        self.with(|c| c.records.push(UpdateRecord::Hierarchy(record)));
    }

    fn accept_full(&mut self, record: FullUpdateRecord) {
        self.with(|c| c.records.push(UpdateRecord::Full(record)));
    }

    fn finish(&mut self) {
        self.with(|c| {
            c.open = false;
            c.passes += 1;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_collected_records() {
        let reader = CollectingSink::new();
        let mut writer = reader.clone();
        writer.start();
        assert!(reader.is_in_pass());
        writer.accept_full(FullUpdateRecord {
            ruleset_id: "R1".into(),
            kind: FullUpdateKind::Content,
        });
        writer.finish();

        assert_eq!(reader.passes(), 1);
        assert!(!reader.is_in_pass());
        assert_eq!(reader.drain().len(), 1);
        assert!(reader.records().is_empty());
    }
}
