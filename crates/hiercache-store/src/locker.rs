//! Cross-connection hierarchy level locks.
//!
//! A lock is the level row's `lock_timestamp`. Checking and stamping
//! happen in one immediate transaction, so two connections sharing a disk
//! store can never both see the level free and both stamp it.

use crate::cache::NodesCache;
use crate::error::CacheError;
use crate::txn::CacheTxn;
use chrono::{DateTime, Utc};
use hiercache_kernel::{HierarchyLevelId, HierarchyLevelIdentifier};
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockOptions {
    /// Also refuse the lock while any level below is locked.
    pub check_locked_child_levels: bool,
    /// Make a single attempt instead of polling until the lock is free.
    pub disable_lock_wait: bool,
}

impl LockOptions {
    pub fn no_wait() -> Self {
        Self {
            disable_lock_wait: true,
            ..Self::default()
        }
    }

    pub fn with_child_check(mut self) -> Self {
        self.check_locked_child_levels = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The level was free and is now stamped by this locker.
    Acquired(HierarchyLevelId),
    /// This locker already held the level; the stamp was refreshed.
    Extended(HierarchyLevelId),
    /// Another holder has the level, an ancestor or (when asked) a
    /// descendant locked.
    NotAcquired,
    /// The parent node is gone, so the level can no longer exist.
    ParentRemoved,
}

impl LockOutcome {
    pub fn is_held(self) -> bool {
        matches!(self, LockOutcome::Acquired(_) | LockOutcome::Extended(_))
    }
}

/// Result of [`HierarchyLevelLocker::get_or_create_level`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelClaim {
    /// The level did not exist; it was created and locked by this locker.
    Created(HierarchyLevelId),
    /// The level already existed and is not locked by anyone now.
    Existing(HierarchyLevelId),
    ParentRemoved,
}

#[derive(Debug, Clone, Copy)]
struct HeldLock {
    level_id: HierarchyLevelId,
    stamped_at: i64,
}

/// Holds (or waits for) the lock of one hierarchy level. Dropping a
/// locker releases what it holds.
#[derive(Debug)]
pub struct HierarchyLevelLocker {
    cache: Arc<NodesCache>,
    identifier: HierarchyLevelIdentifier,
    held: Option<HeldLock>,
}

impl HierarchyLevelLocker {
    pub fn new(cache: Arc<NodesCache>, identifier: HierarchyLevelIdentifier) -> Self {
        Self {
            cache,
            identifier,
            held: None,
        }
    }

    pub fn identifier(&self) -> &HierarchyLevelIdentifier {
        &self.identifier
    }

    pub fn cache(&self) -> &Arc<NodesCache> {
        &self.cache
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Level id of the held lock.
    pub fn level_id(&self) -> Option<HierarchyLevelId> {
        self.held.map(|held| held.level_id)
    }

    fn timeout_ms(&self) -> i64 {
        self.cache.config().lock_timeout_ms as i64
    }

    /// Acquire the lock, polling every `lock_wait_ms` while it is taken
    /// unless `options.disable_lock_wait` is set.
    pub fn lock(&mut self, options: LockOptions) -> Result<LockOutcome, CacheError> {
        loop {
            let outcome = self.try_lock_at(options, Utc::now())?;
            if outcome != LockOutcome::NotAcquired || options.disable_lock_wait {
                return Ok(outcome);
            }
            tracing::trace!(ruleset = %self.identifier.ruleset_id, "hierarchy level locked, waiting");
            thread::sleep(self.cache.config().lock_wait());
        }
    }

    /// One lock attempt as of `now`.
    ///
    /// A locker that stamped its lock less than half a timeout ago only
    /// refreshes the stamp. Older holds are re-checked from scratch.
    pub fn try_lock_at(
        &mut self,
        options: LockOptions,
        now: DateTime<Utc>,
    ) -> Result<LockOutcome, CacheError> {
        let now_ms = now.timestamp_millis();
        if let Some(held) = self.held
            && now_ms - held.stamped_at < self.timeout_ms() / 2
        {
            let refreshed = self.cache.savepoint(|txn| {
                txn.refresh_hierarchy_level_lock(held.level_id, &self.identifier, now)
            })?;
            if refreshed {
                self.held = Some(HeldLock {
                    level_id: held.level_id,
                    stamped_at: now_ms,
                });
                tracing::trace!(level = %held.level_id, "extended hierarchy level lock");
                return Ok(LockOutcome::Extended(held.level_id));
            }
            self.held = None;
        }

        let previous = self.held.take();
        let identifier = &self.identifier;
        let outcome = self.cache.savepoint(|txn| {
            if let Some(previous) = previous {
                txn.remove_hierarchy_level_lock(previous.level_id)?;
            }
            if txn.is_hierarchy_level_locked(identifier, now)? {
                return Ok(LockOutcome::NotAcquired);
            }
            if options.check_locked_child_levels
                && txn.is_any_child_hierarchy_level_locked(identifier, now)?
            {
                return Ok(LockOutcome::NotAcquired);
            }
            if let Some(parent) = identifier.parent_node_id
                && txn.get_node(parent)?.is_none()
            {
                return Ok(LockOutcome::ParentRemoved);
            }
            let level_id = txn.create_or_get_hierarchy_level(
                identifier.parent_node_id,
                &identifier.ruleset_id,
                identifier.removal_id,
            )?;
            txn.stamp_hierarchy_level_lock(level_id, now)?;
            Ok(LockOutcome::Acquired(level_id))
        })?;

        if let LockOutcome::Acquired(level_id) = outcome {
            self.held = Some(HeldLock {
                level_id,
                stamped_at: now_ms,
            });
            tracing::debug!(
                level = %level_id,
                ruleset = %self.identifier.ruleset_id,
                "acquired hierarchy level lock"
            );
        }
        Ok(outcome)
    }

    /// Keep a held lock alive.
    ///
    /// When the locked row was retired meanwhile (its subtree soft-deleted
    /// and rebuilt), the lock is taken again on the live level without
    /// waiting. Returns whether the lock is held afterwards.
    pub fn heartbeat(&mut self) -> Result<bool, CacheError> {
        let Some(held) = self.held else {
            return Ok(false);
        };
        let now = Utc::now();
        let refreshed = self.cache.savepoint(|txn| {
            txn.refresh_hierarchy_level_lock(held.level_id, &self.identifier, now)
        })?;
        if refreshed {
            self.held = Some(HeldLock {
                level_id: held.level_id,
                stamped_at: now.timestamp_millis(),
            });
            tracing::trace!(level = %held.level_id, "hierarchy level lock heartbeat");
            return Ok(true);
        }
        self.held = None;
        let outcome = self.try_lock_at(LockOptions::no_wait(), now)?;
        tracing::debug!(
            previous = %held.level_id,
            reacquired = outcome.is_held(),
            "hierarchy level lock moved to a rebuilt level"
        );
        Ok(outcome.is_held())
    }

    /// Run `f` on a held lock and stamp the lock again in the same
    /// savepoint, recreating the level row if `f` removed it.
    ///
    /// `None` when nothing is held, or when the parent node is gone after
    /// `f`; the lock is released in that case.
    pub fn rewrite_locked<T>(
        &mut self,
        f: impl FnOnce(&CacheTxn<'_>) -> Result<T, CacheError>,
    ) -> Result<Option<T>, CacheError> {
        if self.held.is_none() {
            return Ok(None);
        }
        let now = Utc::now();
        let identifier = &self.identifier;
        let (value, level_id) = self.cache.savepoint(|txn| {
            let value = f(txn)?;
            if let Some(parent) = identifier.parent_node_id
                && txn.get_node(parent)?.is_none()
            {
                return Ok((value, None));
            }
            let level_id = txn.create_or_get_hierarchy_level(
                identifier.parent_node_id,
                &identifier.ruleset_id,
                identifier.removal_id,
            )?;
            txn.stamp_hierarchy_level_lock(level_id, now)?;
            Ok((value, Some(level_id)))
        })?;

        let previous = self.held.take();
        let Some(level_id) = level_id else {
            if let Some(previous) = previous {
                self.cache
                    .savepoint(|txn| txn.remove_hierarchy_level_lock(previous.level_id))?;
            }
            return Ok(None);
        };
        self.held = Some(HeldLock {
            level_id,
            stamped_at: now.timestamp_millis(),
        });
        tracing::trace!(
            level = %level_id,
            moved = previous.is_some_and(|p| p.level_id != level_id),
            "rewrote locked hierarchy level"
        );
        Ok(Some(value))
    }

    /// Release the lock, if held.
    pub fn unlock(&mut self) -> Result<(), CacheError> {
        let Some(held) = self.held.take() else {
            return Ok(());
        };
        self.cache
            .savepoint(|txn| txn.remove_hierarchy_level_lock(held.level_id))?;
        tracing::debug!(level = %held.level_id, "released hierarchy level lock");
        Ok(())
    }

    pub fn is_locked(&self) -> Result<bool, CacheError> {
        self.is_locked_at(Utc::now())
    }

    /// Whether the level (or an ancestor) carries a fresh lock as of `now`,
    /// whoever holds it.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> Result<bool, CacheError> {
        self.cache
            .read(|txn| txn.is_hierarchy_level_locked(&self.identifier, now))
    }

    /// Poll until nobody else holds the level. Never acquires it.
    pub fn wait_for_unlock(&self) -> Result<(), CacheError> {
        if self.held.is_some() {
            return Ok(());
        }
        while self.is_locked()? {
            tracing::trace!(ruleset = %self.identifier.ruleset_id, "waiting for hierarchy level unlock");
            thread::sleep(self.cache.config().lock_wait());
        }
        Ok(())
    }

    /// Find the level, creating it when missing.
    ///
    /// A level created here is locked right away in the same transaction,
    /// since nobody else can be working on it yet. For an existing level
    /// this waits until no one holds it.
    pub fn get_or_create_level(&mut self) -> Result<LevelClaim, CacheError> {
        let now = Utc::now();
        let identifier = &self.identifier;
        let claim = self.cache.savepoint(|txn| {
            if let Some(level) = txn.find_hierarchy_level(identifier)? {
                return Ok(LevelClaim::Existing(level.id));
            }
            if let Some(parent) = identifier.parent_node_id
                && txn.get_node(parent)?.is_none()
            {
                return Ok(LevelClaim::ParentRemoved);
            }
            let level_id = txn.create_or_get_hierarchy_level(
                identifier.parent_node_id,
                &identifier.ruleset_id,
                identifier.removal_id,
            )?;
            txn.stamp_hierarchy_level_lock(level_id, now)?;
            Ok(LevelClaim::Created(level_id))
        })?;
        match claim {
            LevelClaim::Created(level_id) => {
                self.held = Some(HeldLock {
                    level_id,
                    stamped_at: now.timestamp_millis(),
                });
                tracing::debug!(level = %level_id, "created and locked hierarchy level");
            }
            LevelClaim::Existing(_) => self.wait_for_unlock()?,
            LevelClaim::ParentRemoved => {}
        }
        Ok(claim)
    }
}

impl Drop for HierarchyLevelLocker {
    fn drop(&mut self) {
        if let Err(err) = self.unlock() {
            tracing::warn!(
                ruleset = %self.identifier.ruleset_id,
                error = %err,
                "failed to release hierarchy level lock"
            );
        }
    }
}
