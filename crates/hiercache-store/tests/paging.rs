mod common;

use common::{cache_instance, data_source, instance_node, memory_cache};
use hiercache_kernel::{NodeIndex, NodeVisibility, RulesetVariables};
use hiercache_store::PagedNodes;

fn labels<I>(nodes: I) -> Vec<String>
where
    I: IntoIterator<Item = Result<std::sync::Arc<hiercache_kernel::NavNode>, hiercache_store::CacheError>>,
{
    nodes
        .into_iter()
        .map(|node| node.expect("node").label.clone())
        .collect()
}

#[test]
fn level_is_read_in_pages() {
    let cache = memory_cache();
    let level = cache
        .create_or_get_hierarchy_level(None, "R1", None)
        .expect("level");
    let ds = data_source(&cache, level, 0, &[]);
    for instance in 1..=3 {
        cache_instance(&cache, ds, None, 10, instance, instance);
    }

    let mut pages = PagedNodes::level(cache.clone(), level, RulesetVariables::new()).with_page_size(2);
    assert_eq!(pages.total_count().expect("count"), 3);
    assert!(!pages.has_virtual_nodes().expect("probe"));
    assert_eq!(pages.next_page().expect("page").map(|p| p.len()), Some(2));
    assert_eq!(pages.next_page().expect("page").map(|p| p.len()), Some(1));
    assert!(pages.next_page().expect("end").is_none());
    assert!(pages.next_page().expect("still the end").is_none());

    let all = labels(PagedNodes::level(cache, level, RulesetVariables::new()).with_page_size(2));
    assert_eq!(all, vec!["10:1", "10:2", "10:3"]);
}

#[test]
fn sources_are_ordered_by_their_index() {
    let cache = memory_cache();
    let level = cache
        .create_or_get_hierarchy_level(None, "R1", None)
        .expect("level");
    let second = data_source(&cache, level, 1, &[]);
    let first = data_source(&cache, level, 0, &[]);
    cache_instance(&cache, second, None, 10, 1, 0);
    cache_instance(&cache, first, None, 10, 2, 5);
    cache_instance(&cache, first, None, 10, 3, 7);

    let all = labels(PagedNodes::level(cache.clone(), level, RulesetVariables::new()));
    assert_eq!(all, vec!["10:2", "10:3", "10:1"]);

    let partial = labels(PagedNodes::data_source(cache, first, RulesetVariables::new()));
    assert_eq!(partial, vec!["10:2", "10:3"]);
}

#[test]
fn virtual_nodes_are_replaced_by_their_children() {
    let cache = memory_cache();
    let level = cache
        .create_or_get_hierarchy_level(None, "R1", None)
        .expect("level");
    let ds = data_source(&cache, level, 0, &[]);
    cache_instance(&cache, ds, None, 10, 1, 0);
    let mut group = instance_node(None, 20, 1);
    let group_id = cache
        .cache_node(&mut group, ds, &NodeIndex::new(vec![1]), NodeVisibility::Virtual)
        .expect("virtual node");
    cache_instance(&cache, ds, None, 10, 3, 2);
    let hidden = cache_instance(&cache, ds, None, 10, 4, 3);
    cache
        .savepoint(|txn| txn.make_hidden(hidden, Some(ds)))
        .expect("hide");

    let child_level = cache
        .create_or_get_hierarchy_level(Some(group_id), "R1", None)
        .expect("child level");
    let child_ds = data_source(&cache, child_level, 0, &[]);
    cache_instance(&cache, child_ds, Some(group.hash_path()), 30, 1, 0);
    cache_instance(&cache, child_ds, Some(group.hash_path()), 30, 2, 1);

    let pages = PagedNodes::level(cache.clone(), level, RulesetVariables::new());
    assert!(pages.has_virtual_nodes().expect("probe"));
    assert_eq!(pages.total_count().expect("count"), 4);
    assert_eq!(labels(pages), vec!["10:1", "30:1", "30:2", "10:3"]);
}
