mod common;

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::{CONNECTION, TestSource, cache_instance, data_source, memory_cache, temp_dir};
use hiercache_kernel::HierarchyLevelIdentifier;
use hiercache_store::{
    CacheConfig, HierarchyLevelLocker, LockOptions, LockOutcome, NodesCache,
};
use std::sync::{Arc, Barrier};
use std::thread;

fn root(ruleset: &str) -> HierarchyLevelIdentifier {
    HierarchyLevelIdentifier::live(CONNECTION, ruleset, None)
}

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0)
        .single()
        .expect("valid timestamp")
        + Duration::seconds(seconds)
}

#[test]
fn lock_then_unlock() {
    let cache = memory_cache();
    let mut locker = HierarchyLevelLocker::new(cache, root("R1"));
    assert!(locker.lock(LockOptions::default()).expect("lock").is_held());
    assert!(locker.is_locked().expect("probe"));
    locker.unlock().expect("unlock");
    assert!(!locker.is_locked().expect("probe"));
}

#[test]
fn ancestor_lock_covers_child_levels() {
    let cache = memory_cache();
    let level = cache
        .create_or_get_hierarchy_level(None, "R1", None)
        .expect("level");
    let ds = data_source(&cache, level, 0, &[]);
    let parent = cache_instance(&cache, ds, None, 10, 1, 0);
    let child = HierarchyLevelIdentifier::live(CONNECTION, "R1", Some(parent));

    let mut top = HierarchyLevelLocker::new(cache.clone(), root("R1"));
    assert!(top.try_lock_at(LockOptions::no_wait(), at(0)).expect("lock").is_held());

    let mut below = HierarchyLevelLocker::new(cache.clone(), child.clone());
    assert_eq!(
        below.try_lock_at(LockOptions::no_wait(), at(1)).expect("child"),
        LockOutcome::NotAcquired
    );

    top.unlock().expect("unlock");
    assert!(below.try_lock_at(LockOptions::no_wait(), at(2)).expect("child").is_held());

    // A locked child only blocks lockers that ask about children.
    let mut checking = HierarchyLevelLocker::new(cache.clone(), root("R1"));
    assert_eq!(
        checking
            .try_lock_at(LockOptions::no_wait().with_child_check(), at(3))
            .expect("root with child check"),
        LockOutcome::NotAcquired
    );
    assert!(
        checking
            .try_lock_at(LockOptions::no_wait(), at(3))
            .expect("root")
            .is_held()
    );
}

#[test]
fn missing_parent_is_reported_not_waited_on() {
    let cache = memory_cache();
    let level = cache
        .create_or_get_hierarchy_level(None, "R1", None)
        .expect("level");
    let ds = data_source(&cache, level, 0, &[]);
    let parent = cache_instance(&cache, ds, None, 10, 1, 0);
    cache
        .savepoint(|txn| txn.reset_data_source(ds))
        .expect("reset removes the parent node");

    let mut locker = HierarchyLevelLocker::new(
        cache,
        HierarchyLevelIdentifier::live(CONNECTION, "R1", Some(parent)),
    );
    assert_eq!(
        locker.lock(LockOptions::default()).expect("lock"),
        LockOutcome::ParentRemoved
    );
}

#[test]
fn concurrent_lockers_never_both_win() {
    let cache = memory_cache();
    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut locker = HierarchyLevelLocker::new(cache, root("R1"));
                barrier.wait();
                let outcome = locker
                    .lock(LockOptions::no_wait())
                    .expect("lock attempt");
                // Keep the winner's lock alive until every attempt is done.
                barrier.wait();
                outcome.is_held()
            })
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|handle| handle.join().expect("locker thread"))
        .filter(|held| *held)
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn lockers_on_separate_connections_exclude_each_other() {
    let dir = temp_dir("locks");
    let source = TestSource::file(&dir);
    let first_cache =
        Arc::new(NodesCache::open(&source, CacheConfig::default()).expect("open first"));
    let second_cache =
        Arc::new(NodesCache::open(&source, CacheConfig::default()).expect("open second"));

    let mut first = HierarchyLevelLocker::new(first_cache.clone(), root("R1"));
    let mut second = HierarchyLevelLocker::new(second_cache.clone(), root("R1"));
    assert!(first.try_lock_at(LockOptions::no_wait(), at(0)).expect("first").is_held());
    assert_eq!(
        second.try_lock_at(LockOptions::no_wait(), at(1)).expect("second"),
        LockOutcome::NotAcquired
    );

    // An abandoned lock lapses after the timeout.
    let timeout = first_cache.config().lock_timeout_ms as i64;
    let lapsed = at(0) + Duration::milliseconds(timeout);
    assert!(second.try_lock_at(LockOptions::no_wait(), lapsed).expect("second").is_held());

    drop(first);
    drop(second);
    drop(first_cache);
    drop(second_cache);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn rewriting_a_locked_level_never_lets_the_lock_lapse() {
    let dir = temp_dir("rewrite");
    let source = TestSource::file(&dir);
    let ours = Arc::new(NodesCache::open(&source, CacheConfig::default()).expect("open ours"));
    let theirs = Arc::new(NodesCache::open(&source, CacheConfig::default()).expect("open theirs"));

    let mut locker = HierarchyLevelLocker::new(ours.clone(), root("R1"));
    assert!(locker.lock(LockOptions::no_wait()).expect("lock").is_held());
    let old_level = locker.level_id().expect("held level");
    let ds = data_source(&ours, old_level, 0, &[]);
    cache_instance(&ours, ds, None, 10, 1, 0);

    let removed = locker
        .rewrite_locked(|txn| {
            let removal_id = txn
                .soft_delete_subtree(&root("R1"))?
                .expect("live level to retire");
            txn.hard_delete(removal_id)
        })
        .expect("rewrite")
        .expect("lock still held");
    assert_eq!(removed, 1);

    let new_level = locker.level_id().expect("lock moved to the new level");
    assert_ne!(new_level, old_level);
    let mut other = HierarchyLevelLocker::new(theirs.clone(), root("R1"));
    assert_eq!(
        other.lock(LockOptions::no_wait()).expect("other"),
        LockOutcome::NotAcquired
    );

    locker.unlock().expect("unlock");
    assert!(other.lock(LockOptions::no_wait()).expect("other").is_held());

    drop(locker);
    drop(other);
    drop(ours);
    drop(theirs);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn rewrite_without_a_held_lock_does_nothing() {
    let cache = memory_cache();
    let mut locker = HierarchyLevelLocker::new(cache.clone(), root("R1"));
    let ran = locker
        .rewrite_locked(|_| Ok(()))
        .expect("rewrite");
    assert!(ran.is_none());
    assert_eq!(
        cache.read(|txn| txn.count_rows("hierarchy_levels")).expect("count"),
        0
    );
}

#[test]
fn waiting_for_unlock_never_acquires() {
    let cache = memory_cache();
    let mut holder = HierarchyLevelLocker::new(cache.clone(), root("R1"));
    assert!(holder.lock(LockOptions::no_wait()).expect("lock").is_held());

    let waiter_cache = cache.clone();
    let waiter = thread::spawn(move || {
        let waiter = HierarchyLevelLocker::new(waiter_cache, root("R1"));
        waiter.wait_for_unlock().expect("wait");
        waiter.is_held()
    });
    thread::sleep(std::time::Duration::from_millis(300));
    assert!(!waiter.is_finished(), "waiter returned while the level was locked");
    holder.unlock().expect("unlock");

    let waiter_held = waiter.join().expect("waiter thread");
    assert!(!waiter_held);
    let probe = HierarchyLevelLocker::new(cache, root("R1"));
    assert!(!probe.is_locked().expect("probe"));
}
