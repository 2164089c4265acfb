//! Entry points for change notifications.

use crate::affected::{LockedTarget, discover_affected_levels, discover_levels_using_variable};
use crate::collaborators::{
    ContentCache, NoContentCache, NodesProviderFactory, NothingExpanded, UiStateProvider,
};
use crate::error::UpdateError;
use crate::records::{FullUpdateKind, UpdateRecordsSink};
use crate::registry::{CacheRegistry, RegisteredCache};
use crate::tasks::{TaskContext, TaskQueue, UpdateTask};
use crate::updater::{LevelRefresher, PassState};
use hiercache_kernel::InstanceKey;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Turns change notifications into update passes.
///
/// Passes are serialized: the sink lock is held from `start` to `finish`,
/// so records of two passes never interleave.
pub struct UpdateHandler {
    registry: Arc<CacheRegistry>,
    providers: Arc<dyn NodesProviderFactory>,
    ui_state: Arc<dyn UiStateProvider>,
    content: Arc<dyn ContentCache>,
    sink: Mutex<Box<dyn UpdateRecordsSink>>,
}

impl std::fmt::Debug for UpdateHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateHandler")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl UpdateHandler {
    pub fn new(
        registry: Arc<CacheRegistry>,
        providers: Arc<dyn NodesProviderFactory>,
        sink: Box<dyn UpdateRecordsSink>,
    ) -> Self {
        Self {
            registry,
            providers,
            ui_state: Arc::new(NothingExpanded),
            content: Arc::new(NoContentCache),
            sink: Mutex::new(sink),
        }
    }

    pub fn with_ui_state(mut self, ui_state: Arc<dyn UiStateProvider>) -> Self {
        self.ui_state = ui_state;
        self
    }

    pub fn with_content_cache(mut self, content: Arc<dyn ContentCache>) -> Self {
        self.content = content;
        self
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    fn registered(&self, connection_id: &str) -> Result<RegisteredCache, UpdateError> {
        self.registry
            .get(connection_id)
            .ok_or_else(|| UpdateError::MissingCache {
                connection_id: connection_id.to_string(),
            })
    }

    /// Instances of `connection_id` were inserted, updated or deleted.
    pub fn notify_instances_changed(
        &self,
        connection_id: &str,
        changes: &[InstanceKey],
    ) -> Result<(), UpdateError> {
        let registered = self.registered(connection_id)?;
        registered
            .cache
            .note_source_modified(registered.source.as_ref())?;
        tracing::info!(connection = connection_id, changes = changes.len(), "instances changed");
        self.run_pass(|| {
            let locked =
                discover_affected_levels(&registered.cache, registered.source.as_ref(), changes)?;
            Ok(refresh_tasks(connection_id, locked, FullUpdateKind::Content, None))
        })
    }

    /// The value of ruleset variable `variable_id` changed.
    pub fn notify_setting_changed(
        &self,
        connection_id: &str,
        ruleset_id: &str,
        variable_id: &str,
    ) -> Result<(), UpdateError> {
        let registered = self.registered(connection_id)?;
        tracing::info!(
            connection = connection_id,
            ruleset = ruleset_id,
            variable = variable_id,
            "ruleset variable changed"
        );
        self.run_pass(|| {
            let locked = discover_levels_using_variable(&registered.cache, ruleset_id, variable_id)?;
            Ok(refresh_tasks(
                connection_id,
                locked,
                FullUpdateKind::Content,
                Some(ruleset_id),
            ))
        })
    }

    /// The ruleset is gone: drop its hierarchies everywhere.
    pub fn notify_ruleset_disposed(&self, ruleset_id: &str) -> Result<(), UpdateError> {
        tracing::info!(ruleset = ruleset_id, "ruleset disposed");
        self.run_pass(|| {
            let mut tasks: Vec<UpdateTask> = self
                .registry
                .connection_ids()
                .into_iter()
                .map(|connection_id| UpdateTask::ClearHierarchyCache {
                    connection_id,
                    ruleset_id: ruleset_id.to_string(),
                })
                .collect();
            tasks.push(UpdateTask::InvalidateContent {
                ruleset_id: ruleset_id.to_string(),
                report: FullUpdateKind::Both,
            });
            Ok(tasks)
        })
    }

    fn run_pass(
        &self,
        plan: impl FnOnce() -> Result<Vec<UpdateTask>, UpdateError>,
    ) -> Result<(), UpdateError> {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        sink.start();
        let result = plan().and_then(|tasks| {
            let mut queue = TaskQueue::new();
            queue.extend(tasks);
            let mut context = TaskContext {
                registry: &self.registry,
                refresher: LevelRefresher {
                    providers: self.providers.as_ref(),
                    ui_state: self.ui_state.as_ref(),
                },
                content: self.content.as_ref(),
                sink: &mut **sink,
                pass: PassState::default(),
            };
            context.run(queue)
        });
        sink.finish();
        if let Err(err) = &result {
            tracing::warn!(error = %err, "update pass aborted");
        }
        result
    }
}

/// Refreshes for locked levels, then one content invalidation per
/// affected ruleset (plus `always`, if given).
fn refresh_tasks(
    connection_id: &str,
    locked: Vec<LockedTarget>,
    report: FullUpdateKind,
    always: Option<&str>,
) -> Vec<UpdateTask> {
    let mut rulesets: BTreeSet<String> = always.map(str::to_string).into_iter().collect();
    let mut tasks = Vec::with_capacity(locked.len() + 1);
    for target in locked {
        rulesets.insert(target.target.identifier.ruleset_id.clone());
        tasks.push(UpdateTask::refresh_locked(connection_id, target));
    }
    tasks.extend(
        rulesets
            .into_iter()
            .map(|ruleset_id| UpdateTask::InvalidateContent { ruleset_id, report }),
    );
    tasks
}
