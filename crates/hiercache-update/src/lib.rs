//! # hiercache-update
//!
//! Keeps cached hierarchies in step with their source.
//!
//! A notification (changed instances, a changed ruleset variable, a
//! disposed ruleset) becomes one update pass:
//!
//! ```text
//! notify_* -> discover + lock affected levels
//!          -> TaskQueue:  refresh levels      (3)
//!                         invalidate content  (2)
//!                         report records      (1) -> UpdateRecordsSink
//! ```
//!
//! Levels are rebuilt by host-supplied node providers writing through the
//! `hiercache-store` API. Hosts say which nodes are expanded, so reports can
//! carry the new positions of expanded children.

pub mod affected;
pub mod collaborators;
pub mod error;
pub mod handler;
pub mod records;
pub mod registry;
pub mod tasks;
pub mod updater;

pub use affected::{
    LockedTarget, RefreshTarget, discover_affected_levels, discover_levels_using_variable,
};
pub use collaborators::{
    ContentCache, NoContentCache, NodesProvider, NodesProviderFactory, NothingExpanded,
    ProviderContext, UiStateProvider,
};
pub use error::UpdateError;
pub use handler::UpdateHandler;
pub use records::{
    CollectingSink, ExpandedNodeUpdate, FullUpdateKind, FullUpdateRecord, HierarchyUpdateRecord,
    UpdateRecord, UpdateRecordsSink,
};
pub use registry::{CacheRegistry, RegisteredCache};
pub use tasks::{TaskQueue, UpdateTask};
