//! The data source seam.
//!
//! The cache never queries source data itself. Whatever owns the source
//! (a database file, a service) implements [`SourceConnection`] and hands
//! it to the cache and the update engine.

use crate::error::CacheError;
use hiercache_kernel::{ClassId, DataSourceFilter, InstanceKey};
use std::path::Path;
use std::time::UNIX_EPOCH;

pub trait SourceConnection: Send + Sync {
    /// Stable id; one cache per connection id.
    fn id(&self) -> &str;

    /// Backing file, if the source lives in one. Disk stores are placed
    /// next to it unless a directory is configured.
    fn file_path(&self) -> Option<&Path>;

    /// `class_id` together with its base and derived classes.
    fn related_classes(&self, class_id: ClassId) -> Vec<ClassId>;

    /// Whether at least one of `keys` passes `filter` when joined through
    /// the filter's relationship.
    fn any_key_matches_filter(
        &self,
        filter: &DataSourceFilter,
        keys: &[InstanceKey],
    ) -> Result<bool, CacheError>;

    /// Marker that changes whenever the source changes outside this
    /// process. Defaults to the backing file's modification time.
    fn last_modified_marker(&self) -> Option<String> {
        let path = self.file_path()?;
        let modified = std::fs::metadata(path).ok()?.modified().ok()?;
        let millis = modified.duration_since(UNIX_EPOCH).ok()?.as_millis();
        Some(millis.to_string())
    }
}
