mod common;

use common::{CONNECTION, Harness, RULESET, TestSource};
use hiercache_kernel::{HierarchyLevelIdentifier, InstanceKey, RulesetVariables};
use hiercache_store::{CacheConfig, HierarchyLevelLocker};
use hiercache_update::UpdateError;
use std::sync::Arc;

fn labels(nodes: &[Arc<hiercache_kernel::NavNode>]) -> Vec<String> {
    nodes.iter().map(|node| node.label.clone()).collect()
}

#[test]
fn inserted_instance_rebuilds_the_root_level() {
    let h = Harness::new();
    h.model.set(None, &[(10, 1), (10, 2)]);
    h.build(None, RulesetVariables::new());

    h.model.set(None, &[(10, 1), (10, 2), (10, 3)]);
    h.handler
        .notify_instances_changed(CONNECTION, &[InstanceKey::new(10, 3)])
        .expect("update pass");

    insta::assert_json_snapshot!(h.drain_records(), @r###"
    [
      {
        "count": 3,
        "expanded": [],
        "parent": null,
        "record": "hierarchy",
        "ruleset": "R1"
      },
      {
        "kind": "content",
        "record": "full",
        "ruleset": "R1"
      }
    ]
    "###);
    assert_eq!(h.model.builds(), vec!["root", "root"]);
    assert_eq!(h.content.rulesets(), vec![RULESET]);
    assert_eq!(h.sink.passes(), 1);
    assert_eq!(
        labels(&h.level_nodes(None, RulesetVariables::new())),
        vec!["10:1", "10:2", "10:3"]
    );
}

#[test]
fn expanded_children_are_reported_at_their_new_positions() {
    let h = Harness::new();
    h.model.set(None, &[(10, 1), (10, 2)]);
    h.model.set(Some("10:2"), &[(20, 1)]);
    let roots = h.build(None, RulesetVariables::new());
    h.build(Some(&roots[1]), RulesetVariables::new());
    h.expanded.expand(&roots[1]);

    h.model.set(None, &[(10, 3), (10, 1), (10, 2)]);
    h.handler
        .notify_instances_changed(CONNECTION, &[InstanceKey::new(10, 3)])
        .expect("update pass");

    insta::assert_json_snapshot!(h.drain_records(), @r###"
    [
      {
        "count": 3,
        "expanded": [
          {
            "label": "10:2",
            "position": 2
          }
        ],
        "parent": null,
        "record": "hierarchy",
        "ruleset": "R1"
      },
      {
        "kind": "content",
        "record": "full",
        "ruleset": "R1"
      }
    ]
    "###);

    // The old subtree went with the root level; children are rebuilt on
    // the next expansion.
    let rebuilt = h.level_nodes(None, RulesetVariables::new());
    assert_eq!(labels(&rebuilt), vec!["10:3", "10:1", "10:2"]);
    assert!(h.level_nodes(Some(&rebuilt[2]), RulesetVariables::new()).is_empty());
}

#[test]
fn nested_affected_levels_rebuild_only_the_topmost() {
    let h = Harness::new();
    h.model.set(None, &[(10, 1), (10, 2)]);
    h.model.set(Some("10:2"), &[(20, 1)]);
    let roots = h.build(None, RulesetVariables::new());
    h.build(Some(&roots[1]), RulesetVariables::new());

    h.handler
        .notify_instances_changed(
            CONNECTION,
            &[InstanceKey::new(10, 1), InstanceKey::new(20, 1)],
        )
        .expect("update pass");

    assert_eq!(h.model.builds(), vec!["root", "10:2", "root"]);
    assert_eq!(h.sink.drain().len(), 2);
}

#[test]
fn emptied_child_level_refreshes_its_grandparent() {
    let h = Harness::new();
    h.model.set(None, &[(10, 1)]);
    h.model.set(Some("10:1"), &[(20, 1)]);
    let roots = h.build(None, RulesetVariables::new());
    h.build(Some(&roots[0]), RulesetVariables::new());
    h.expanded.expand(&roots[0]);

    h.model.set(Some("10:1"), &[]);
    h.handler
        .notify_instances_changed(CONNECTION, &[InstanceKey::new(20, 1)])
        .expect("update pass");

    insta::assert_json_snapshot!(h.drain_records(), @r###"
    [
      {
        "count": 0,
        "expanded": [],
        "parent": "10:1",
        "record": "hierarchy",
        "ruleset": "R1"
      },
      {
        "count": 1,
        "expanded": [
          {
            "label": "10:1",
            "position": 0
          }
        ],
        "parent": null,
        "record": "hierarchy",
        "ruleset": "R1"
      },
      {
        "kind": "content",
        "record": "full",
        "ruleset": "R1"
      }
    ]
    "###);
    assert_eq!(h.model.builds(), vec!["root", "10:1", "10:1", "root"]);
}

#[test]
fn collapsed_parent_is_rebuilt_without_a_report() {
    let h = Harness::new();
    h.model.set(None, &[(10, 1)]);
    h.model.set(Some("10:1"), &[(20, 1)]);
    let roots = h.build(None, RulesetVariables::new());
    h.build(Some(&roots[0]), RulesetVariables::new());

    h.model.set(Some("10:1"), &[(20, 1), (20, 2)]);
    h.handler
        .notify_instances_changed(CONNECTION, &[InstanceKey::new(20, 2)])
        .expect("update pass");

    assert_eq!(h.model.builds(), vec!["root", "10:1", "10:1"]);
    insta::assert_json_snapshot!(h.drain_records(), @r###"
    [
      {
        "kind": "content",
        "record": "full",
        "ruleset": "R1"
      }
    ]
    "###);
    let parent = h.level_nodes(None, RulesetVariables::new());
    assert_eq!(
        labels(&h.level_nodes(Some(&parent[0]), RulesetVariables::new())),
        vec!["20:1", "20:2"]
    );
}

#[test]
fn unrelated_change_reports_nothing() {
    let h = Harness::new();
    h.model.set(None, &[(10, 1)]);
    h.build(None, RulesetVariables::new());

    h.handler
        .notify_instances_changed(CONNECTION, &[InstanceKey::new(99, 1)])
        .expect("update pass");

    assert!(h.sink.records().is_empty());
    assert_eq!(h.sink.passes(), 1);
    assert_eq!(h.model.builds(), vec!["root"]);
}

#[test]
fn setting_change_refreshes_levels_reading_the_variable() {
    let h = Harness::new();
    let variables = RulesetVariables::new().with("show", true);
    h.model.set(None, &[(10, 1)]);
    h.build(None, variables.clone());

    h.handler
        .notify_setting_changed(CONNECTION, RULESET, "show")
        .expect("update pass");
    insta::assert_json_snapshot!(h.drain_records(), @r###"
    [
      {
        "count": 1,
        "expanded": [],
        "parent": null,
        "record": "hierarchy",
        "ruleset": "R1"
      },
      {
        "kind": "content",
        "record": "full",
        "ruleset": "R1"
      }
    ]
    "###);
    assert_eq!(h.level_nodes(None, variables).len(), 1);

    h.handler
        .notify_setting_changed(CONNECTION, RULESET, "unused")
        .expect("update pass");
    insta::assert_json_snapshot!(h.drain_records(), @r###"
    [
      {
        "kind": "content",
        "record": "full",
        "ruleset": "R1"
      }
    ]
    "###);
    assert_eq!(h.model.builds(), vec!["root", "root"]);
}

#[test]
fn disposed_ruleset_is_cleared_from_every_cache() {
    let h = Harness::new();
    h.model.set(None, &[(10, 1)]);
    h.build(None, RulesetVariables::new());
    let other = h
        .registry
        .register(Arc::new(TestSource::new("other")), CacheConfig::memory())
        .expect("register second cache");
    other
        .create_or_get_hierarchy_level(None, RULESET, None)
        .expect("level");

    h.handler
        .notify_ruleset_disposed(RULESET)
        .expect("update pass");

    insta::assert_json_snapshot!(h.drain_records(), @r###"
    [
      {
        "kind": "both",
        "record": "full",
        "ruleset": "R1"
      }
    ]
    "###);
    for (connection, cache) in [(CONNECTION, &h.cache), ("other", &other)] {
        let root = HierarchyLevelIdentifier::live(connection, RULESET, None);
        assert!(cache.find_hierarchy_level(&root).expect("find").is_none());
    }
    assert_eq!(h.content.rulesets(), vec![RULESET]);
}

#[test]
fn unknown_connection_aborts_before_a_pass() {
    let h = Harness::new();
    let err = h
        .handler
        .notify_instances_changed("missing", &[InstanceKey::new(10, 1)])
        .expect_err("no cache for connection");
    assert!(matches!(err, UpdateError::MissingCache { connection_id } if connection_id == "missing"));
    assert_eq!(h.sink.passes(), 0);
}

#[test]
fn failed_pass_is_finished_and_releases_its_locks() {
    let h = Harness::new();
    h.model.set(None, &[(10, 1)]);
    h.build(None, RulesetVariables::new());
    h.model.fail();

    let err = h
        .handler
        .notify_instances_changed(CONNECTION, &[InstanceKey::new(10, 2)])
        .expect_err("provider fails");
    assert!(matches!(err, UpdateError::Provider(_)));
    assert_eq!(h.sink.passes(), 1);
    assert!(!h.sink.is_in_pass());

    let root = HierarchyLevelIdentifier::live(CONNECTION, RULESET, None);
    let locker = HierarchyLevelLocker::new(h.cache.clone(), root);
    assert!(!locker.is_locked().expect("lock state"));
}

#[test]
fn rebuilt_level_stays_locked_while_its_provider_runs() {
    let h = Harness::new();
    h.model.set(None, &[(10, 1)]);
    h.build(None, RulesetVariables::new());

    h.handler
        .notify_instances_changed(CONNECTION, &[InstanceKey::new(10, 1)])
        .expect("update pass");

    assert_eq!(h.model.locked_during_builds(), vec![false, true]);
    assert_eq!(h.sink.drain().len(), 2);
    let root = HierarchyLevelIdentifier::live(CONNECTION, RULESET, None);
    let probe = HierarchyLevelLocker::new(h.cache.clone(), root);
    assert!(!probe.is_locked().expect("lock state"));
}

#[test]
fn rebuilt_level_reports_the_provider_count() {
    let h = Harness::new();
    h.model.set(None, &[(10, 1), (10, 2)]);
    h.build(None, RulesetVariables::new());

    h.model.report_count(7);
    h.handler
        .notify_instances_changed(CONNECTION, &[InstanceKey::new(10, 2)])
        .expect("update pass");

    insta::assert_json_snapshot!(h.drain_records(), @r###"
    [
      {
        "count": 7,
        "expanded": [],
        "parent": null,
        "record": "hierarchy",
        "ruleset": "R1"
      },
      {
        "kind": "content",
        "record": "full",
        "ruleset": "R1"
      }
    ]
    "###);
}

#[test]
fn concurrent_notifications_never_interleave_passes() {
    let h = Harness::new();
    h.model.set(None, &[(10, 1)]);
    h.build(None, RulesetVariables::new());

    std::thread::scope(|scope| {
        for instance in 0..4 {
            let handler = &h.handler;
            scope.spawn(move || {
                handler
                    .notify_instances_changed(CONNECTION, &[InstanceKey::new(10, instance)])
                    .expect("update pass");
            });
        }
    });

    assert_eq!(h.sink.passes(), 4);
    assert!(!h.sink.is_in_pass());
    // Every pass rebuilt the root and reported it once, plus one full record.
    assert_eq!(h.sink.drain().len(), 8);
}
