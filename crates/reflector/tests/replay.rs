//! Replay-style tests: drive a mirror the way the watch loop does and
//! check the resulting state.

#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::Resource;
use specular_core::KeyScope;
use specular_reflector::Mirror;

fn pod(ns: &str, name: &str) -> Pod {
    let mut p = Pod::default();
    p.metadata.name = Some(name.to_string());
    p.metadata.namespace = Some(ns.to_string());
    p
}

fn keyed(scope: KeyScope, pods: Vec<Pod>) -> Vec<(String, Pod)> {
    pods.into_iter()
        .map(|p| (scope.key_for(p.meta()).unwrap(), p))
        .collect()
}

#[test]
fn added_then_deleted_round_trip() {
    // Listing of N pods, ADDED p1, then DELETED p1: size goes N -> N+1 -> N.
    let scope = KeyScope::Namespaced;
    let mirror = Mirror::new();
    mirror.replace(keyed(scope, vec![pod("hub", "a"), pod("hub", "b")]));
    assert_eq!(mirror.len(), 2);

    let p1 = pod("hub", "p1");
    mirror.upsert(scope.key_for(p1.meta()).unwrap(), p1.clone());
    assert_eq!(mirror.len(), 3);
    assert!(mirror.get("p1").is_some());

    mirror.remove(&scope.key_for(p1.meta()).unwrap());
    assert_eq!(mirror.len(), 2);
    assert!(mirror.get("p1").is_none());
}

#[test]
fn modified_replaces_the_stored_object() {
    let scope = KeyScope::Namespaced;
    let mirror = Mirror::new();
    mirror.replace(keyed(scope, vec![pod("hub", "p1")]));

    let mut updated = pod("hub", "p1");
    updated.metadata.resource_version = Some("42".to_string());
    mirror.upsert(scope.key_for(updated.meta()).unwrap(), updated);

    assert_eq!(mirror.len(), 1);
    let stored = mirror.get("p1").unwrap();
    assert_eq!(stored.metadata.resource_version.as_deref(), Some("42"));
}

#[test]
fn cluster_scope_keeps_same_names_apart() {
    let scope = KeyScope::Cluster;
    let mirror = Mirror::new();
    mirror.replace(keyed(
        scope,
        vec![pod("alpha", "worker"), pod("beta", "worker")],
    ));
    assert_eq!(mirror.len(), 2);
    assert!(mirror.get("alpha/worker").is_some());
    assert!(mirror.get("beta/worker").is_some());
}

#[test]
fn relist_establishes_a_new_baseline() {
    let scope = KeyScope::Namespaced;
    let mirror = Mirror::new();
    mirror.replace(keyed(scope, vec![pod("hub", "a"), pod("hub", "b")]));

    // Incremental state accumulated between relists...
    let extra = pod("hub", "stray");
    mirror.upsert(scope.key_for(extra.meta()).unwrap(), extra);
    assert_eq!(mirror.len(), 3);

    // ...is superseded entirely by the next full listing.
    mirror.replace(keyed(scope, vec![pod("hub", "b"), pod("hub", "c")]));
    let snap = mirror.snapshot();
    assert_eq!(snap.len(), 2);
    assert!(snap.contains_key("b"));
    assert!(snap.contains_key("c"));
    assert!(!snap.contains_key("a"));
    assert!(!snap.contains_key("stray"));
}

#[test]
fn concurrent_readers_see_whole_snapshots() {
    let scope = KeyScope::Namespaced;
    let mirror = Arc::new(Mirror::new());
    mirror.replace(keyed(scope, (0..50).map(|i| pod("hub", &format!("p{i}"))).collect()));

    let reader = {
        let mirror = Arc::clone(&mirror);
        std::thread::spawn(move || {
            for _ in 0..200 {
                let snap = mirror.snapshot();
                // Writer alternates between 50 and 51 entries; a reader
                // must never see anything else.
                assert!(snap.len() == 50 || snap.len() == 51, "len={}", snap.len());
            }
        })
    };

    for _ in 0..100 {
        let extra = pod("hub", "extra");
        mirror.upsert("extra".to_string(), extra);
        mirror.remove("extra");
    }
    reader.join().unwrap();
}
