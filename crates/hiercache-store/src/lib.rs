//! # hiercache-store
//!
//! Persistent cache of computed navigation hierarchies.
//!
//! This crate provides:
//! - the SQLite store and its lifecycle (`StoreFactory`)
//! - `NodesCache`, the per-connection cache engine with scoped transactions
//! - `HierarchyLevelLocker`, timestamp locks shared across processes
//! - `HotNodeCache`, a small in-process node cache
//! - `PagedNodes`, lazy paged reads of a level or a data source
//!
//! ## Layout
//!
//! ```text
//! <source dir>/<source file>-hierarchies      (SQLite, WAL)
//!     rulesets -> variables
//!              -> hierarchy_levels -> data_sources -> data_source_nodes -> nodes
//!                                                                       -> node_keys
//!                                                                       -> node_instances
//!                                                                       -> merged_nodes
//! ```
//!
//! Deleting a level cascades through everything below it; a trigger drops
//! nodes once their last data source association is gone.

pub mod cache;
pub mod config;
pub mod error;
pub mod factory;
pub mod functions;
pub mod hot;
pub mod iterator;
pub mod locker;
pub mod maintenance;
pub mod schema;
pub mod source;
pub mod txn;

mod locks;
mod nodes;
mod related;
mod sql;

pub use cache::NodesCache;
pub use config::{CacheConfig, StoreKind};
pub use error::CacheError;
pub use factory::{STORE_SUFFIX, StoreFactory, StoreLocation, store_path};
pub use hot::HotNodeCache;
pub use iterator::{DataSourceNodes, HierarchyLevelNodes, NodePageQuery, PagedNodes};
pub use locker::{HierarchyLevelLocker, LevelClaim, LockOptions, LockOutcome};
pub use source::SourceConnection;
pub use txn::{CacheTxn, RulesetUse};
