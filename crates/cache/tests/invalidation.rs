#![forbid(unsafe_code)]

use std::sync::Arc;

use tiller_cache::Cache;

fn seed(cache: &mut Cache, keys: &[&str]) {
    for k in keys {
        cache.put(*k, Arc::new(k.to_string()));
    }
}

#[test]
fn invalidation_is_transitive() {
    let mut cache = Cache::new();
    seed(&mut cache, &["A", "B", "C"]);

    // A derived from B, B derived from C.
    cache.link("A", "B");
    cache.link("B", "C");

    cache.invalidate("C");

    assert!(!cache.contains("A"));
    assert!(!cache.contains("B"));
    assert!(!cache.contains("C"));
    assert!(cache.is_empty());
}

#[test]
fn invalidating_the_top_owner_leaves_sources_alone() {
    let mut cache = Cache::new();
    seed(&mut cache, &["A", "B", "C"]);
    cache.link("A", "B");
    cache.link("B", "C");

    // Nothing is derived from A, so only A goes.
    cache.invalidate("A");

    assert!(!cache.contains("A"));
    assert!(cache.contains("B"));
    assert!(cache.contains("C"));
}

#[test]
fn cyclic_links_terminate() {
    let mut cache = Cache::new();
    seed(&mut cache, &["A", "B"]);
    cache.link("A", "B");
    cache.link("B", "A");

    cache.invalidate("A");

    assert!(!cache.contains("A"));
    assert!(!cache.contains("B"));
}

#[test]
fn self_link_terminates() {
    let mut cache = Cache::new();
    seed(&mut cache, &["A"]);
    cache.link("A", "A");

    cache.invalidate("A");
    assert!(cache.is_empty());
}

#[test]
fn diamond_invalidation() {
    let mut cache = Cache::new();
    seed(&mut cache, &["group", "m1", "m2", "route"]);

    // One group derived from two mappings; a route derived from the group.
    cache.link("group", "m1");
    cache.link("group", "m2");
    cache.link("route", "group");

    cache.invalidate("m1");

    assert!(!cache.contains("m1"));
    assert!(!cache.contains("group"));
    assert!(!cache.contains("route"));
    // The sibling source survives; its link to the dead group dangles
    // harmlessly.
    assert!(cache.contains("m2"));
}

#[test]
fn link_is_idempotent_and_order_agnostic() {
    let mut cache = Cache::new();

    // Links may be declared before either endpoint is cached.
    cache.link("owner", "owned");
    cache.link("owner", "owned");

    seed(&mut cache, &["owner", "owned"]);
    assert_eq!(cache.links().get("owner").unwrap().len(), 1);

    cache.invalidate("owned");
    assert!(!cache.contains("owner"));
}

#[test]
fn unknown_keys_are_noops() {
    let mut cache = Cache::new();
    seed(&mut cache, &["A"]);

    cache.invalidate("nope");
    cache.link("nope", "also-nope");

    assert!(cache.contains("A"));
    assert_eq!(cache.stats().invalidate_calls, 1);
    assert_eq!(cache.stats().invalidated_objects, 0);
}

#[test]
fn reset_clears_entries_links_and_stats() {
    let mut cache = Cache::new();
    seed(&mut cache, &["A", "B"]);
    cache.link("A", "B");
    cache.get("A");
    cache.get("missing");

    cache.reset();

    assert!(cache.is_empty());
    assert!(cache.links().is_empty());
    assert_eq!(cache.stats().hits, 0);
    assert_eq!(cache.stats().misses, 0);
}

#[test]
fn invalidation_counts_objects() {
    let mut cache = Cache::new();
    seed(&mut cache, &["A", "B", "C"]);
    cache.link("A", "B");
    cache.link("B", "C");

    cache.invalidate("C");

    let stats = cache.stats();
    assert_eq!(stats.invalidate_calls, 1);
    assert_eq!(stats.invalidated_objects, 3);
}
