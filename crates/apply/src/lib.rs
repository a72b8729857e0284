//! Converge apply: converge one object (or an ordered set) onto the cluster.
//!
//! Create when absent, short-circuit on an unchanged content hash, otherwise
//! patch. The patch strategy is picked once per engine from the backend's
//! capabilities; conflicts are retried with exponential backoff.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use converge_core::{ApplyError, ClusterError, K8sObject, ObjectSet, HASH_ANNOTATION};
use converge_kubehub::{Capabilities, ClusterState, PassContext, Patch, WriteOptions};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::OnceCell;
use tracing::{debug, warn, Level};

const MAX_BACKOFF: Duration = Duration::from_secs(2);

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Recorded as owner of every field an apply patch writes.
    pub field_manager: String,
    /// Total attempts per object when the cluster reports conflicts.
    pub max_attempts: u32,
    /// First retry delay; doubles per retry up to 2s.
    pub backoff: Duration,
    pub dry_run: bool,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self { field_manager: "converge".into(), max_attempts: 5, backoff: Duration::from_millis(50), dry_run: false }
    }
}

impl ApplyConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            field_manager: env_or("CONVERGE_FIELD_MANAGER", d.field_manager),
            max_attempts: env_or("CONVERGE_APPLY_MAX_ATTEMPTS", d.max_attempts).max(1),
            backoff: Duration::from_millis(env_or("CONVERGE_APPLY_BACKOFF_MS", 50u64)),
            dry_run: env_flag("CONVERGE_DRY_RUN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Per-outcome counts for one ordered set plus every object that failed.
#[derive(Debug, Clone, Default)]
pub struct SetApplyReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub errors: Vec<ApplyError>,
}

impl SetApplyReport {
    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Created => self.created += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub fn is_ok(&self) -> bool { self.errors.is_empty() }
}

/// Field-level change counts between two documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv { s.updates += 1; }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

pub struct ApplyEngine {
    cluster: Arc<dyn ClusterState>,
    cfg: ApplyConfig,
    field_manager: String,
    caps: Arc<OnceCell<Capabilities>>,
}

impl ApplyEngine {
    pub fn new(cluster: Arc<dyn ClusterState>, cfg: ApplyConfig) -> Self {
        let field_manager = cfg.field_manager.clone();
        Self { cluster, cfg, field_manager, caps: Arc::new(OnceCell::new()) }
    }

    /// Engine writing as `<field_manager>-<component>`; shares the capability probe.
    pub fn for_component(&self, component: &str) -> Self {
        Self {
            cluster: self.cluster.clone(),
            cfg: self.cfg.clone(),
            field_manager: format!("{}-{}", self.cfg.field_manager, component),
            caps: self.caps.clone(),
        }
    }

    pub fn config(&self) -> &ApplyConfig { &self.cfg }

    pub fn field_manager(&self) -> &str { &self.field_manager }

    /// Probed on first use and kept for the engine's lifetime.
    pub async fn capabilities(&self, ctx: &PassContext) -> Result<Capabilities, ClusterError> {
        self.caps.get_or_try_init(|| ctx.guard(self.cluster.capabilities())).await.copied()
    }

    /// Converge a single object. `force` re-applies even when the stored hash matches.
    pub async fn apply_object(&self, ctx: &PassContext, desired: &K8sObject, force: bool) -> Result<ApplyOutcome, ApplyError> {
        let t0 = Instant::now();
        let res = self.converge(ctx, desired, force).await;
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(ApplyOutcome::Created) => { counter!("apply_created_total", 1u64); }
            Ok(ApplyOutcome::Updated) => { counter!("apply_updated_total", 1u64); }
            Ok(ApplyOutcome::Unchanged) => { counter!("apply_unchanged_total", 1u64); }
            Err(e) => {
                counter!("apply_err_total", 1u64);
                warn!(key = %desired.key(), error = %e, "apply failed");
            }
        }
        res.map_err(|cause| ApplyError { key: desired.key().clone(), cause })
    }

    /// Apply every object in declared order. One failure does not stop the rest.
    pub async fn apply_set(&self, ctx: &PassContext, set: &ObjectSet, force: bool) -> SetApplyReport {
        let mut report = SetApplyReport::default();
        for obj in set {
            match self.apply_object(ctx, obj, force).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => report.errors.push(e),
            }
            ctx.advance();
        }
        report
    }

    async fn converge(&self, ctx: &PassContext, desired: &K8sObject, force: bool) -> Result<ApplyOutcome, ClusterError> {
        let caps = self.capabilities(ctx).await?;
        let hash = desired.hash();
        let mut target = desired.clone();
        target.set_annotation(HASH_ANNOTATION, &hash);
        let mut delay = self.cfg.backoff;
        let mut attempt = 1u32;
        loop {
            match self.attempt(ctx, &target, &hash, force, &caps).await {
                Err(e) if e.is_retryable() && attempt < self.cfg.max_attempts => {
                    counter!("apply_conflict_retries_total", 1u64);
                    warn!(key = %target.key(), attempt, backoff_ms = delay.as_millis() as u64, error = %e, "conflict; retrying");
                    ctx.guard(async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                    delay = (delay * 2).min(MAX_BACKOFF);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// One read-compare-write round. Conflicts bubble up so the caller re-reads.
    async fn attempt(&self, ctx: &PassContext, target: &K8sObject, hash: &str, force: bool, caps: &Capabilities) -> Result<ApplyOutcome, ClusterError> {
        // dry run against a backend that cannot validate without persisting: compute only
        let write = !self.cfg.dry_run || caps.dry_run;
        let Some(live) = ctx.guard(self.cluster.get(target.key())).await? else {
            if write {
                let opts = WriteOptions { field_manager: self.field_manager.clone(), dry_run: self.cfg.dry_run };
                ctx.guard(self.cluster.create(target, &opts)).await?;
            }
            debug!(key = %target.key(), dry_run = self.cfg.dry_run, "created");
            return Ok(ApplyOutcome::Created);
        };
        if !force && live.stored_hash() == Some(hash) {
            debug!(key = %target.key(), "unchanged");
            return Ok(ApplyOutcome::Unchanged);
        }
        if write {
            let patch = Patch::apply(target, &self.field_manager, force).dry_run(self.cfg.dry_run).for_capabilities(caps);
            ctx.guard(self.cluster.patch(&patch)).await?;
        }
        if tracing::enabled!(Level::DEBUG) {
            let diff = diff_summary(&target.user_content(), &live.user_content());
            debug!(key = %target.key(), adds = diff.adds, updates = diff.updates, removes = diff.removes, dry_run = self.cfg.dry_run, "updated");
        }
        Ok(ApplyOutcome::Updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = serde_json::json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3] });
        let target = serde_json::json!({ "a": 2, "b": { "x": 1, "y": 2 }, "c": [1, 9], "d": true });
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
    }

    #[test]
    fn config_defaults() {
        let c = ApplyConfig::default();
        assert_eq!(c.field_manager, "converge");
        assert_eq!(c.max_attempts, 5);
        assert_eq!(c.backoff, Duration::from_millis(50));
        assert!(!c.dry_run);
    }

    #[test]
    fn component_engines_get_their_own_field_manager() {
        let cluster: Arc<dyn ClusterState> = Arc::new(converge_kubehub::MemoryCluster::new());
        let base = ApplyEngine::new(cluster, ApplyConfig::default());
        assert_eq!(base.field_manager(), "converge");
        let pilot = base.for_component("pilot");
        assert_eq!(pilot.field_manager(), "converge-pilot");
        assert_eq!(base.for_component("gateway").field_manager(), "converge-gateway");
        assert!(Arc::ptr_eq(&base.caps, &pilot.caps));
    }
}
