#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use converge_apply::{ApplyConfig, ApplyEngine, ApplyOutcome};
use converge_core::{ClusterError, K8sObject, ObjectSet, HASH_ANNOTATION};
use converge_kubehub::{MemoryCluster, PassContext, PatchStrategy};

fn cm(name: &str, value: &str) -> K8sObject {
    K8sObject::from_value(serde_json::json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": "ns" },
        "data": { "k": value },
    }))
    .unwrap()
}

fn fast() -> ApplyConfig {
    ApplyConfig { backoff: Duration::from_millis(1), ..ApplyConfig::default() }
}

fn engine(cluster: &Arc<MemoryCluster>, cfg: ApplyConfig) -> ApplyEngine {
    ApplyEngine::new(cluster.clone(), cfg)
}

#[tokio::test]
async fn creates_when_absent() {
    let cluster = Arc::new(MemoryCluster::new());
    let eng = engine(&cluster, fast());
    let ctx = PassContext::new();
    let obj = cm("a", "1");
    assert_eq!(eng.apply_object(&ctx, &obj, false).await.unwrap(), ApplyOutcome::Created);
    let live = cluster.object(obj.key()).unwrap();
    assert_eq!(live.stored_hash(), Some(obj.hash().as_str()));
    assert_eq!(live.content()["data"]["k"], "1");
}

#[tokio::test]
async fn updates_when_present_and_converges() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(cm("a", "old"));
    let eng = engine(&cluster, fast());
    let ctx = PassContext::new();
    let desired = cm("a", "new");
    assert_eq!(eng.apply_object(&ctx, &desired, false).await.unwrap(), ApplyOutcome::Updated);
    let live = cluster.object(desired.key()).unwrap();
    assert_eq!(live.hash(), desired.hash());
    let patches = cluster.stats().patches;
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].strategy, PatchStrategy::Apply);
}

#[tokio::test]
async fn unchanged_object_issues_no_writes() {
    let cluster = Arc::new(MemoryCluster::new());
    let eng = engine(&cluster, fast());
    let ctx = PassContext::new();
    let obj = cm("a", "1");
    eng.apply_object(&ctx, &obj, false).await.unwrap();
    cluster.reset_stats();
    assert_eq!(eng.apply_object(&ctx, &obj, false).await.unwrap(), ApplyOutcome::Unchanged);
    let stats = cluster.stats();
    assert_eq!(stats.writes(), 0);
    assert_eq!(stats.gets, 1);
}

#[tokio::test]
async fn force_bypasses_hash_short_circuit() {
    let cluster = Arc::new(MemoryCluster::new());
    let eng = engine(&cluster, fast());
    let ctx = PassContext::new();
    let obj = cm("a", "1");
    eng.apply_object(&ctx, &obj, false).await.unwrap();
    cluster.reset_stats();
    assert_eq!(eng.apply_object(&ctx, &obj, true).await.unwrap(), ApplyOutcome::Updated);
    let patches = cluster.stats().patches;
    assert_eq!(patches.len(), 1);
    assert!(patches[0].force);
}

#[tokio::test]
async fn falls_back_to_merge_and_drops_force() {
    let cluster = Arc::new(MemoryCluster::new().without_apply_patch());
    let mut live = cm("a", "old");
    live.set_label("extra", "kept");
    cluster.insert(live);
    let eng = engine(&cluster, fast());
    let ctx = PassContext::new();
    let desired = cm("a", "new");
    assert_eq!(eng.apply_object(&ctx, &desired, true).await.unwrap(), ApplyOutcome::Updated);
    let patches = cluster.stats().patches;
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].strategy, PatchStrategy::Merge);
    assert!(!patches[0].force);
    let after = cluster.object(desired.key()).unwrap();
    assert_eq!(after.content()["data"]["k"], "new");
    assert_eq!(after.label("extra"), Some("kept"));
    assert_eq!(after.annotation(HASH_ANNOTATION), Some(desired.hash().as_str()));
}

#[tokio::test]
async fn conflicts_are_retried_until_success() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(cm("a", "old"));
    let desired = cm("a", "new");
    cluster.inject_conflicts(desired.key(), 3);
    let eng = engine(&cluster, fast());
    let ctx = PassContext::new();
    assert_eq!(eng.apply_object(&ctx, &desired, false).await.unwrap(), ApplyOutcome::Updated);
    let stats = cluster.stats();
    assert_eq!(stats.patches.len(), 4);
    // every retry re-reads the live object
    assert_eq!(stats.gets, 4);
}

#[tokio::test]
async fn create_race_is_retried_through_update_path() {
    let cluster = Arc::new(MemoryCluster::new());
    let desired = cm("a", "1");
    cluster.inject_conflicts(desired.key(), 1);
    let eng = engine(&cluster, fast());
    let ctx = PassContext::new();
    assert_eq!(eng.apply_object(&ctx, &desired, false).await.unwrap(), ApplyOutcome::Created);
    assert_eq!(cluster.stats().creates.len(), 2);
}

#[tokio::test]
async fn conflict_exhaustion_reports_apply_error() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(cm("a", "old"));
    let desired = cm("a", "new");
    cluster.inject_conflicts(desired.key(), 100);
    let eng = engine(&cluster, ApplyConfig { max_attempts: 3, ..fast() });
    let ctx = PassContext::new();
    let err = eng.apply_object(&ctx, &desired, false).await.unwrap_err();
    assert_eq!(&err.key, desired.key());
    assert!(err.cause.is_conflict());
    assert_eq!(cluster.stats().patches.len(), 3);
}

#[tokio::test]
async fn other_errors_surface_without_retry() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(cm("a", "old"));
    let desired = cm("a", "new");
    cluster.reject_writes(desired.key());
    let eng = engine(&cluster, fast());
    let ctx = PassContext::new();
    let err = eng.apply_object(&ctx, &desired, false).await.unwrap_err();
    assert!(matches!(err.cause, ClusterError::Invalid(_)));
    assert_eq!(cluster.stats().patches.len(), 1);
    assert_eq!(cluster.object(desired.key()).unwrap().content()["data"]["k"], "old");
}

#[tokio::test]
async fn dry_run_without_backend_support_writes_nothing() {
    let cluster = Arc::new(MemoryCluster::new().without_dry_run());
    cluster.insert(cm("a", "old"));
    let eng = engine(&cluster, ApplyConfig { dry_run: true, ..fast() });
    let ctx = PassContext::new();
    assert_eq!(eng.apply_object(&ctx, &cm("a", "new"), false).await.unwrap(), ApplyOutcome::Updated);
    assert_eq!(eng.apply_object(&ctx, &cm("b", "1"), false).await.unwrap(), ApplyOutcome::Created);
    assert_eq!(cluster.stats().writes(), 0);
    assert_eq!(cluster.len(), 1);
}

#[tokio::test]
async fn dry_run_with_backend_support_persists_nothing() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(cm("a", "old"));
    let eng = engine(&cluster, ApplyConfig { dry_run: true, ..fast() });
    let ctx = PassContext::new();
    assert_eq!(eng.apply_object(&ctx, &cm("a", "new"), false).await.unwrap(), ApplyOutcome::Updated);
    assert_eq!(eng.apply_object(&ctx, &cm("b", "1"), false).await.unwrap(), ApplyOutcome::Created);
    assert_eq!(cluster.len(), 1);
    assert_eq!(cluster.object(cm("a", "x").key()).unwrap().content()["data"]["k"], "old");
}

#[tokio::test]
async fn set_failure_does_not_stop_siblings() {
    let cluster = Arc::new(MemoryCluster::new());
    let set = ObjectSet::from_objects(vec![cm("a", "1"), cm("b", "1"), cm("c", "1")]).unwrap();
    cluster.reject_writes(cm("b", "1").key());
    let eng = engine(&cluster, fast());
    let ctx = PassContext::new();
    let report = eng.apply_set(&ctx, &set, false).await;
    assert_eq!(report.created, 2);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].key.name, "b");
    assert!(cluster.object(cm("c", "1").key()).is_some());
    assert_eq!(ctx.progress(), 3);
}

#[tokio::test]
async fn cancelled_pass_yields_cancelled_errors() {
    let cluster = Arc::new(MemoryCluster::new().with_latency(Duration::from_secs(30)));
    let eng = engine(&cluster, fast());
    let ctx = PassContext::new().with_timeout(Duration::from_millis(20));
    let err = eng.apply_object(&ctx, &cm("a", "1"), false).await.unwrap_err();
    assert_eq!(err.cause, ClusterError::Cancelled);
}
