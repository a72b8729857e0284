//! Converge reconcile: run apply + prune for many components in one pass.
//!
//! Every component gets its own worker task. A pass runs in two rounds:
//! all components apply, then the ones that applied cleanly prune. Workers
//! share a fresh [`PassContext`] so each kind is swept once per pass, a
//! component that failed to apply is never pruned (nor are its objects by
//! another component's sweep), and the pass deadline bounds every call.
//! Failures aggregate into the [`PassReport`]; nothing fails fast.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use converge_apply::ApplyEngine;
use converge_core::{AggregateError, Failure, Gvk, LabelSelector, ObjectKey, ObjectSet, Ownership, Stage};
use converge_kubehub::{ClusterState, PassContext};
use converge_prune::PruneEngine;
use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

mod config;
pub mod manifest;
pub mod status;

pub use config::ReconcileConfig;
pub use manifest::{ComponentManifest, DirManifestSource, ManifestSource};
pub use status::{LogSink, StatusSink};

/// Desired state is unusable; reported before any cluster call.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("owner must not be empty")]
    EmptyOwner,
    #[error("revision must not be empty")]
    EmptyRevision,
    #[error("component name must not be empty")]
    EmptyComponentName,
    #[error("duplicate component {0}")]
    DuplicateComponent(String),
    #[error("{key} declared by both {first} and {second}")]
    DuplicateObject { key: ObjectKey, first: String, second: String },
    #[error("{}: {message}", path.display())]
    Manifest { path: PathBuf, message: String },
}

/// What one pass should converge to.
#[derive(Debug, Clone, Default)]
pub struct ReconcileSpec {
    pub owner: String,
    pub revision: String,
    pub components: Vec<ComponentManifest>,
    /// Swept for every component in addition to the kinds it declares.
    pub prune_kinds: Vec<Gvk>,
}

impl ReconcileSpec {
    pub fn new(owner: &str, revision: &str) -> Self {
        Self { owner: owner.to_string(), revision: revision.to_string(), ..Default::default() }
    }

    pub fn component(mut self, name: &str, objects: ObjectSet) -> Self {
        self.components.push(ComponentManifest::new(name, objects));
        self
    }

    pub fn prune_kind(mut self, gvk: Gvk) -> Self {
        self.prune_kinds.push(gvk);
        self
    }

    pub fn selector(&self) -> LabelSelector { Ownership::owner_selector(&self.owner, &self.revision) }

    pub fn validate(&self) -> Result<(), InputError> {
        if self.owner.trim().is_empty() { return Err(InputError::EmptyOwner); }
        if self.revision.trim().is_empty() { return Err(InputError::EmptyRevision); }
        let mut names: FxHashSet<&str> = FxHashSet::default();
        let mut owners: FxHashMap<_, &str> = FxHashMap::default();
        for c in &self.components {
            if c.name.trim().is_empty() { return Err(InputError::EmptyComponentName); }
            if !names.insert(c.name.as_str()) {
                return Err(InputError::DuplicateComponent(c.name.clone()));
            }
            for key in c.objects.keys() {
                if let Some(first) = owners.insert(key.loose(), c.name.as_str()) {
                    return Err(InputError::DuplicateObject { key: key.clone(), first: first.to_string(), second: c.name.clone() });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentPhase {
    Pending,
    Applying,
    Pruning,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentReport {
    pub name: String,
    pub phase: ComponentPhase,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub pruned: usize,
    pub failed: usize,
    pub failures: Vec<Failure>,
}

impl ComponentReport {
    fn new(name: &str) -> Self {
        Self { name: name.to_string(), phase: ComponentPhase::Pending, created: 0, updated: 0, unchanged: 0, pruned: 0, failed: 0, failures: Vec::new() }
    }

    fn fail(&mut self, failures: impl IntoIterator<Item = Failure>) {
        let name = self.name.clone();
        self.failures.extend(failures.into_iter().map(|f| f.component(&name)));
        self.failed = self.failures.len();
        self.phase = ComponentPhase::Failed;
    }

    pub fn is_failed(&self) -> bool { self.phase == ComponentPhase::Failed }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub revision: String,
    pub components: Vec<ComponentReport>,
    pub elapsed: Duration,
}

impl PassReport {
    pub fn failures(&self) -> impl Iterator<Item = &Failure> { self.components.iter().flat_map(|c| c.failures.iter()) }

    pub fn failed_components(&self) -> usize { self.components.iter().filter(|c| c.is_failed()).count() }

    pub fn component(&self, name: &str) -> Option<&ComponentReport> { self.components.iter().find(|c| c.name == name) }

    /// Writes performed (or planned, in dry-run mode) across all components.
    pub fn writes(&self) -> usize { self.components.iter().map(|c| c.created + c.updated + c.pruned).sum() }

    /// The report when nothing failed; otherwise every failure of the pass.
    pub fn into_result(self) -> Result<PassReport, AggregateError> {
        let agg = AggregateError::new(self.failures().cloned().collect());
        if agg.is_empty() { Ok(self) } else { Err(agg) }
    }
}

/// Last recorded outcome, kept alongside the desired state it was produced from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileStatus {
    pub last_pass: Option<Uuid>,
    pub revision: Option<String>,
    pub passes: u64,
    pub components: Vec<ComponentReport>,
    pub failures: Vec<Failure>,
}

impl ReconcileStatus {
    pub fn record(&mut self, report: &PassReport) {
        self.last_pass = Some(report.pass_id);
        self.revision = Some(report.revision.clone());
        self.passes += 1;
        self.components = report.components.clone();
        self.failures = report.failures().cloned().collect();
    }

    pub fn is_healthy(&self) -> bool { self.failures.is_empty() }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileState {
    pub spec: ReconcileSpec,
    pub status: ReconcileStatus,
}

impl ReconcileState {
    pub fn new(spec: ReconcileSpec) -> Self { Self { spec, status: ReconcileStatus::default() } }
}

pub struct Reconciler {
    cluster: Arc<dyn ClusterState>,
    apply: Arc<ApplyEngine>,
    cfg: ReconcileConfig,
    sink: Option<Arc<dyn StatusSink>>,
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(cluster: Arc<dyn ClusterState>, cfg: ReconcileConfig) -> Self {
        let apply = Arc::new(ApplyEngine::new(cluster.clone(), cfg.apply.clone()));
        Self { cluster, apply, cfg, sink: None, shutdown: CancellationToken::new() }
    }

    /// Cancelling this token aborts the running pass (and any later one).
    pub fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }

    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &ReconcileConfig { &self.cfg }

    /// Run one pass. Only input validation can fail; cluster failures land in the report.
    pub async fn reconcile(&self, spec: &ReconcileSpec) -> Result<PassReport, InputError> {
        spec.validate()?;
        let t0 = Instant::now();
        let desired = spec.components.iter().flat_map(|c| c.objects.keys().map(|k| k.loose()));
        let ctx = Arc::new(PassContext::new().with_parent(&self.shutdown).with_timeout(self.cfg.pass_timeout).with_desired(desired));
        let prune = Arc::new(PruneEngine::new(self.cluster.clone()).with_kinds(spec.prune_kinds.iter().cloned()).dry_run(self.cfg.dry_run()));
        let selector = spec.selector();
        info!(pass_id = %ctx.pass_id(), owner = %spec.owner, revision = %spec.revision, components = spec.components.len(), dry_run = self.cfg.dry_run(), "pass started");

        // Every apply finishes before any sweep starts, so the failed set is
        // complete when kinds are claimed.
        let mut handles = Vec::with_capacity(spec.components.len());
        for comp in &spec.components {
            let ownership = Ownership::new(&spec.owner, &comp.name, &spec.revision);
            let mut objects = comp.objects.clone();
            for obj in objects.iter_mut() { obj.stamp(&ownership); }
            let worker = Worker {
                name: comp.name.clone(),
                objects,
                selector: selector.clone(),
                force: self.cfg.force,
                ctx: ctx.clone(),
                apply: self.apply.for_component(&comp.name),
                prune: prune.clone(),
            };
            handles.push((comp.name.clone(), tokio::spawn(worker.run_apply())));
        }
        let mut components: Vec<ComponentReport> = Vec::with_capacity(handles.len());
        let mut applied = Vec::with_capacity(handles.len());
        for (slot, (name, handle)) in handles.into_iter().enumerate() {
            match handle.await {
                Ok((worker, report)) => {
                    if !report.is_failed() { applied.push((slot, worker)); }
                    components.push(report);
                }
                Err(e) => components.push(crashed(&ctx, &name, e)),
            }
        }

        let mut handles = Vec::with_capacity(applied.len());
        for (slot, worker) in applied {
            let report = components[slot].clone();
            handles.push((slot, tokio::spawn(worker.run_prune(report))));
        }
        for (slot, handle) in handles {
            let name = components[slot].name.clone();
            components[slot] = match handle.await {
                Ok(report) => report,
                Err(e) => crashed(&ctx, &name, e),
            };
        }

        let report = PassReport { pass_id: ctx.pass_id(), revision: spec.revision.clone(), components, elapsed: t0.elapsed() };
        counter!("reconcile_passes_total", 1u64);
        histogram!("reconcile_pass_ms", report.elapsed.as_secs_f64() * 1000.0);
        let failed = report.failed_components();
        if failed > 0 {
            warn!(pass_id = %report.pass_id, failed, objects = ctx.progress(), elapsed_ms = report.elapsed.as_millis() as u64, "pass finished with failures");
        } else {
            info!(pass_id = %report.pass_id, objects = ctx.progress(), elapsed_ms = report.elapsed.as_millis() as u64, "pass finished");
        }
        Ok(report)
    }

    /// Run a pass for `state.spec`, record it into `state.status`, then hand
    /// the state to the status sink. A sink failure is logged, not returned.
    pub async fn reconcile_state(&self, state: &mut ReconcileState) -> Result<PassReport, InputError> {
        let report = self.reconcile(&state.spec).await?;
        state.status.record(&report);
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.record(state) {
                warn!(error = %e, "status sink failed");
            }
        }
        Ok(report)
    }
}

fn crashed(ctx: &PassContext, name: &str, e: tokio::task::JoinError) -> ComponentReport {
    error!(component = %name, error = %e, "worker crashed");
    ctx.mark_failed(name);
    let mut report = ComponentReport::new(name);
    report.fail([Failure { component: None, key: None, stage: Stage::Worker, message: format!("worker crashed: {}", e) }]);
    report
}

/// Everything one component's tasks own.
struct Worker {
    name: String,
    objects: ObjectSet,
    selector: LabelSelector,
    force: bool,
    ctx: Arc<PassContext>,
    apply: ApplyEngine,
    prune: Arc<PruneEngine>,
}

impl Worker {
    /// Apply phase. Hands the worker back for the prune phase.
    async fn run_apply(self) -> (Self, ComponentReport) {
        let mut report = ComponentReport::new(&self.name);
        report.phase = ComponentPhase::Applying;
        let applied = self.apply.apply_set(&self.ctx, &self.objects, self.force).await;
        report.created = applied.created;
        report.updated = applied.updated;
        report.unchanged = applied.unchanged;
        if !applied.is_ok() {
            // no partial prune after a failed apply
            self.ctx.mark_failed(&self.name);
            report.fail(applied.errors.iter().map(Failure::from));
            warn!(component = %self.name, failed = report.failed, "apply failed; prune skipped");
        }
        (self, report)
    }

    async fn run_prune(self, mut report: ComponentReport) -> ComponentReport {
        report.phase = ComponentPhase::Pruning;
        let pruned = self.prune.prune(&self.ctx, &self.objects, &self.selector).await;
        report.pruned = pruned.pruned.len();
        if !pruned.is_ok() {
            self.ctx.mark_failed(&self.name);
            report.fail(pruned.failures());
            warn!(component = %self.name, failed = report.failed, "prune failed");
            return report;
        }
        report.phase = ComponentPhase::Done;
        info!(
            component = %self.name,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            pruned = report.pruned,
            swept = pruned.swept_kinds.len(),
            field_manager = %self.apply.field_manager(),
            "component converged"
        );
        report
    }
}
