//! Update tasks and the queue that orders them.
//!
//! A pass is a queue of tasks. Running a task may yield subtasks, which
//! are queued behind the tasks of equal or higher priority that are still
//! waiting, and ahead of everything of lower priority:
//!
//! ```text
//!   3  refresh hierarchy level, clear hierarchy cache
//!   2  invalidate content
//!   1  report to the sink
//! ```

use crate::affected::{LockedTarget, RefreshTarget};
use crate::collaborators::ContentCache;
use crate::error::UpdateError;
use crate::records::{FullUpdateKind, FullUpdateRecord, HierarchyUpdateRecord, UpdateRecordsSink};
use crate::registry::{CacheRegistry, RegisteredCache};
use crate::updater::{LevelRefresher, PassState};
use hiercache_store::{HierarchyLevelLocker, LockOptions, LockOutcome};
use std::collections::VecDeque;

#[derive(Debug)]
pub enum UpdateTask {
    /// Rebuild one level. Levels found by discovery arrive already locked.
    RefreshHierarchy {
        connection_id: String,
        target: RefreshTarget,
        locker: Option<HierarchyLevelLocker>,
    },
    ClearHierarchyCache {
        connection_id: String,
        ruleset_id: String,
    },
    InvalidateContent {
        ruleset_id: String,
        report: FullUpdateKind,
    },
    ReportHierarchy(HierarchyUpdateRecord),
    ReportFull(FullUpdateRecord),
}

impl UpdateTask {
    pub fn refresh_locked(connection_id: impl Into<String>, locked: LockedTarget) -> Self {
        UpdateTask::RefreshHierarchy {
            connection_id: connection_id.into(),
            target: locked.target,
            locker: Some(locked.locker),
        }
    }

    pub fn refresh(connection_id: impl Into<String>, target: RefreshTarget) -> Self {
        UpdateTask::RefreshHierarchy {
            connection_id: connection_id.into(),
            target,
            locker: None,
        }
    }

    pub fn priority(&self) -> u8 {
        match self {
            UpdateTask::RefreshHierarchy { .. } | UpdateTask::ClearHierarchyCache { .. } => 3,
            UpdateTask::InvalidateContent { .. } => 2,
            UpdateTask::ReportHierarchy(_) | UpdateTask::ReportFull(_) => 1,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            UpdateTask::RefreshHierarchy { .. } => "refresh_hierarchy",
            UpdateTask::ClearHierarchyCache { .. } => "clear_hierarchy_cache",
            UpdateTask::InvalidateContent { .. } => "invalidate_content",
            UpdateTask::ReportHierarchy(_) => "report_hierarchy",
            UpdateTask::ReportFull(_) => "report_full",
        }
    }
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<UpdateTask>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` ahead of the first waiting task of lower priority.
    pub fn push(&mut self, task: UpdateTask) {
        let priority = task.priority();
        let at = self
            .tasks
            .iter()
            .position(|queued| queued.priority() < priority)
            .unwrap_or(self.tasks.len());
        self.tasks.insert(at, task);
    }

    pub fn extend(&mut self, tasks: impl IntoIterator<Item = UpdateTask>) {
        for task in tasks {
            self.push(task);
        }
    }

    pub fn pop(&mut self) -> Option<UpdateTask> {
        self.tasks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// What tasks of one pass run against.
pub struct TaskContext<'a> {
    pub registry: &'a CacheRegistry,
    pub refresher: LevelRefresher<'a>,
    pub content: &'a dyn ContentCache,
    pub sink: &'a mut dyn UpdateRecordsSink,
    pub pass: PassState,
}

impl TaskContext<'_> {
    fn registered(&self, connection_id: &str) -> Result<RegisteredCache, UpdateError> {
        self.registry
            .get(connection_id)
            .ok_or_else(|| UpdateError::MissingCache {
                connection_id: connection_id.to_string(),
            })
    }

    /// Run every queued task, subtasks included.
    pub fn run(&mut self, mut queue: TaskQueue) -> Result<(), UpdateError> {
        let mut executed = 0usize;
        while let Some(task) = queue.pop() {
            tracing::trace!(task = task.name(), waiting = queue.len(), "running update task");
            let subtasks = self.execute(task)?;
            queue.extend(subtasks);
            executed += 1;
        }
        tracing::debug!(tasks = executed, "update pass finished");
        Ok(())
    }

    fn execute(&mut self, task: UpdateTask) -> Result<Vec<UpdateTask>, UpdateError> {
        match task {
            UpdateTask::RefreshHierarchy {
                connection_id,
                target,
                locker,
            } => self.refresh_hierarchy(connection_id, target, locker),
            UpdateTask::ClearHierarchyCache {
                connection_id,
                ruleset_id,
            } => {
                let registered = self.registered(&connection_id)?;
                registered.cache.clear(Some(&ruleset_id))?;
                tracing::debug!(connection = %connection_id, ruleset = %ruleset_id, "cleared ruleset hierarchies");
                Ok(Vec::new())
            }
            UpdateTask::InvalidateContent { ruleset_id, report } => {
                self.content.clear_ruleset(&ruleset_id);
                if !self.pass.claim_full_report(&ruleset_id) {
                    return Ok(Vec::new());
                }
                Ok(vec![UpdateTask::ReportFull(FullUpdateRecord {
                    ruleset_id,
                    kind: report,
                })])
            }
            UpdateTask::ReportHierarchy(record) => {
                self.sink.accept_hierarchy(record);
                Ok(Vec::new())
            }
            UpdateTask::ReportFull(record) => {
                self.sink.accept_full(record);
                Ok(Vec::new())
            }
        }
    }

    fn refresh_hierarchy(
        &mut self,
        connection_id: String,
        target: RefreshTarget,
        locker: Option<HierarchyLevelLocker>,
    ) -> Result<Vec<UpdateTask>, UpdateError> {
        let registered = self.registered(&connection_id)?;
        let mut locker = match locker {
            Some(mut locker) => {
                if !locker.heartbeat()? {
                    tracing::debug!(ruleset = %target.identifier.ruleset_id, "discovered level lock lapsed");
                }
                locker
            }
            None => {
                let mut locker =
                    HierarchyLevelLocker::new(registered.cache.clone(), target.identifier.clone());
                if locker.lock(LockOptions::default())? == LockOutcome::ParentRemoved {
                    return Ok(Vec::new());
                }
                locker
            }
        };

        let outcome = self
            .refresher
            .refresh(&registered, &target, &mut locker, &mut self.pass)?;
        let mut subtasks = Vec::new();
        if let Some(grandparent) = outcome.grandparent {
            subtasks.push(UpdateTask::refresh(connection_id, grandparent));
        }
        if let Some(record) = outcome.report {
            subtasks.push(UpdateTask::ReportHierarchy(record));
        }
        Ok(subtasks)
    }
}
