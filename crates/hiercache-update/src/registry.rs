//! Connection id to cache map, shared by hosts and the update handler.

use hiercache_store::{CacheConfig, CacheError, NodesCache, SourceConnection};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Clone)]
pub struct RegisteredCache {
    pub cache: Arc<NodesCache>,
    pub source: Arc<dyn SourceConnection>,
}

impl std::fmt::Debug for RegisteredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredCache")
            .field("connection_id", &self.source.id())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct CacheRegistry {
    caches: RwLock<BTreeMap<String, RegisteredCache>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache for `source` and register it. An already registered
    /// connection keeps its cache.
    pub fn register(
        &self,
        source: Arc<dyn SourceConnection>,
        config: CacheConfig,
    ) -> Result<Arc<NodesCache>, CacheError> {
        if let Some(existing) = self.get(source.id()) {
            return Ok(existing.cache);
        }
        let cache = Arc::new(NodesCache::open(source.as_ref(), config)?);
        self.register_cache(source, cache.clone());
        Ok(cache)
    }

    /// Register an already opened cache, replacing any previous one.
    pub fn register_cache(&self, source: Arc<dyn SourceConnection>, cache: Arc<NodesCache>) {
        let connection_id = source.id().to_string();
        tracing::debug!(connection = %connection_id, "registered hierarchy cache");
        self.caches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection_id, RegisteredCache { cache, source });
    }

    /// Forget a connection. The cache closes once the last handle drops.
    pub fn unregister(&self, connection_id: &str) -> Option<RegisteredCache> {
        let removed = self
            .caches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection_id);
        if removed.is_some() {
            tracing::debug!(connection = connection_id, "unregistered hierarchy cache");
        }
        removed
    }

    pub fn get(&self, connection_id: &str) -> Option<RegisteredCache> {
        self.caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connection_id)
            .cloned()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
