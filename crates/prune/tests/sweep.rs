#![forbid(unsafe_code)]

use std::sync::Arc;

use converge_core::{GroupKind, Gvk, K8sObject, ObjectSet, Ownership};
use converge_kubehub::{MemoryCluster, PassContext};
use converge_prune::PruneEngine;

fn owned(kind: &str, name: &str, component: &str) -> K8sObject {
    let mut o = K8sObject::from_value(serde_json::json!({
        "apiVersion": "v1", "kind": kind,
        "metadata": { "name": name, "namespace": "ns" },
    }))
    .unwrap();
    o.stamp(&Ownership::new("installed-state", component, "default"));
    o
}

fn selector() -> converge_core::LabelSelector { Ownership::owner_selector("installed-state", "default") }

fn cm_kind() -> GroupKind { GroupKind::new("", "ConfigMap") }

#[tokio::test]
async fn orphans_are_deleted_desired_kept() {
    let cluster = Arc::new(MemoryCluster::new());
    for n in ["a", "b", "c"] { cluster.insert(owned("ConfigMap", n, "pilot")); }
    let desired = ObjectSet::from_objects(vec![owned("ConfigMap", "a", "pilot"), owned("ConfigMap", "b", "pilot")]).unwrap();
    let eng = PruneEngine::new(cluster.clone());
    let report = eng.prune(&PassContext::new(), &desired, &selector()).await;
    assert_eq!(report.pruned.len(), 1);
    assert_eq!(report.pruned[0].name, "c");
    assert!(cluster.object(owned("ConfigMap", "a", "pilot").key()).is_some());
    assert!(cluster.object(owned("ConfigMap", "b", "pilot").key()).is_some());
    assert!(cluster.object(owned("ConfigMap", "c", "pilot").key()).is_none());
    assert_eq!(report.into_result(), Ok(1));
}

#[tokio::test]
async fn unowned_objects_are_never_touched() {
    let cluster = Arc::new(MemoryCluster::new());
    let foreign = K8sObject::parse("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: foreign\n  namespace: ns\n").unwrap();
    cluster.insert(foreign.clone());
    let mut other_rev = owned("ConfigMap", "canary", "pilot");
    other_rev.stamp(&Ownership::new("installed-state", "pilot", "canary"));
    cluster.insert(other_rev.clone());
    let desired = ObjectSet::from_objects(vec![owned("ConfigMap", "a", "pilot")]).unwrap();
    let report = PruneEngine::new(cluster.clone()).prune(&PassContext::new(), &desired, &selector()).await;
    assert!(report.pruned.is_empty());
    assert!(cluster.object(foreign.key()).is_some());
    assert!(cluster.object(other_rev.key()).is_some());
}

#[tokio::test]
async fn concurrent_components_list_a_shared_kind_once() {
    let cluster = Arc::new(MemoryCluster::new());
    for n in ["p1", "g1", "stale"] { cluster.insert(owned("ConfigMap", n, "pilot")); }
    let pilot = ObjectSet::from_objects(vec![owned("ConfigMap", "p1", "pilot")]).unwrap();
    let gateway = ObjectSet::from_objects(vec![owned("ConfigMap", "g1", "gateway")]).unwrap();
    let ctx = PassContext::new().with_desired(pilot.keys().chain(gateway.keys()).map(|k| k.loose()));
    let eng = PruneEngine::new(cluster.clone());
    let sel = selector();
    let (a, b) = futures::join!(eng.prune(&ctx, &pilot, &sel), eng.prune(&ctx, &gateway, &sel));
    assert_eq!(cluster.stats().list_calls(&cm_kind()), 1);
    assert_eq!(a.swept_kinds.len() + b.swept_kinds.len(), 1);
    assert_eq!(a.skipped_kinds.len() + b.skipped_kinds.len(), 1);
    // whichever component swept, the other's desired object survives
    assert!(cluster.object(owned("ConfigMap", "p1", "pilot").key()).is_some());
    assert!(cluster.object(owned("ConfigMap", "g1", "gateway").key()).is_some());
    assert!(cluster.object(owned("ConfigMap", "stale", "pilot").key()).is_none());
}

#[tokio::test]
async fn next_pass_sweeps_again() {
    let cluster = Arc::new(MemoryCluster::new());
    let desired = ObjectSet::from_objects(vec![owned("ConfigMap", "a", "pilot")]).unwrap();
    let eng = PruneEngine::new(cluster.clone());
    eng.prune(&PassContext::new(), &desired, &selector()).await;
    eng.prune(&PassContext::new(), &desired, &selector()).await;
    assert_eq!(cluster.stats().list_calls(&cm_kind()), 2);
}

#[tokio::test]
async fn delete_failures_are_collected_and_sweep_continues() {
    let cluster = Arc::new(MemoryCluster::new());
    for n in ["keep", "x", "y", "z"] { cluster.insert(owned("ConfigMap", n, "pilot")); }
    cluster.reject_deletes(owned("ConfigMap", "y", "pilot").key());
    let desired = ObjectSet::from_objects(vec![owned("ConfigMap", "keep", "pilot")]).unwrap();
    let report = PruneEngine::new(cluster.clone()).prune(&PassContext::new(), &desired, &selector()).await;
    assert_eq!(report.pruned.len(), 2);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].key.name, "y");
    assert_eq!(cluster.len(), 2);
    let agg = report.into_result().unwrap_err();
    assert!(agg.names(owned("ConfigMap", "y", "pilot").key()));
}

#[tokio::test]
async fn sweep_keeps_objects_of_components_already_marked_failed() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(owned("ConfigMap", "old-gateway", "gateway"));
    cluster.insert(owned("ConfigMap", "old-pilot", "pilot"));
    let ctx = PassContext::new();
    ctx.mark_failed("gateway");
    let pilot = ObjectSet::from_objects(vec![owned("ConfigMap", "p", "pilot")]).unwrap();
    let report = PruneEngine::new(cluster.clone()).prune(&ctx, &pilot, &selector()).await;
    assert_eq!(report.pruned.len(), 1);
    assert_eq!(report.pruned[0].name, "old-pilot");
    assert!(cluster.object(owned("ConfigMap", "old-gateway", "gateway").key()).is_some());
}

#[tokio::test]
async fn registered_kinds_are_swept_without_desired_objects() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(owned("Secret", "leftover", "pilot"));
    let desired = ObjectSet::from_objects(vec![owned("ConfigMap", "a", "pilot")]).unwrap();
    let eng = PruneEngine::new(cluster.clone()).with_kinds([Gvk::new("", "v1", "Secret")]);
    let report = eng.prune(&PassContext::new(), &desired, &selector()).await;
    assert_eq!(report.swept_kinds, vec![cm_kind(), GroupKind::new("", "Secret")]);
    assert_eq!(report.pruned.len(), 1);
    assert_eq!(report.pruned[0].gvk.kind, "Secret");
    assert!(cluster.is_empty());
}

#[tokio::test]
async fn dry_run_reports_without_deleting() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(owned("ConfigMap", "stale", "pilot"));
    let eng = PruneEngine::new(cluster.clone()).dry_run(true);
    let report = eng.prune(&PassContext::new(), &ObjectSet::from_objects(vec![owned("ConfigMap", "a", "pilot")]).unwrap(), &selector()).await;
    assert_eq!(report.pruned.len(), 1);
    assert!(cluster.stats().deletes.is_empty());
    assert_eq!(cluster.len(), 1);
}
