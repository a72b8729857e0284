//! Converge prune: delete owned objects that are no longer desired.
//!
//! Each kind is swept at most once per pass. Several components may share a
//! kind; whichever reaches it first claims it in the pass context and lists
//! it with the owner selector, the rest skip it.

#![forbid(unsafe_code)]

use std::sync::Arc;

use converge_core::{AggregateError, ClusterError, Failure, GroupKind, Gvk, LabelSelector, ObjectKey, ObjectSet, PruneError, Stage};
use converge_kubehub::{ClusterState, PassContext};
use metrics::counter;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

/// Outcome of one component's sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub swept_kinds: Vec<GroupKind>,
    /// Kinds another worker already swept this pass.
    pub skipped_kinds: Vec<GroupKind>,
    /// Deleted, or in dry-run mode, would have been deleted.
    pub pruned: Vec<ObjectKey>,
    #[serde(skip)]
    pub errors: Vec<PruneError>,
    #[serde(skip)]
    pub list_errors: Vec<(Gvk, ClusterError)>,
}

impl PruneReport {
    pub fn is_ok(&self) -> bool { self.errors.is_empty() && self.list_errors.is_empty() }

    pub fn failures(&self) -> Vec<Failure> {
        let lists = self.list_errors.iter().map(|(gvk, e)| Failure {
            component: None,
            key: None,
            stage: Stage::Prune,
            message: format!("list {}: {}", gvk, e),
        });
        lists.chain(self.errors.iter().map(Failure::from)).collect()
    }

    /// Number of pruned objects, or every failure of the sweep.
    pub fn into_result(self) -> Result<usize, AggregateError> {
        if self.is_ok() { Ok(self.pruned.len()) } else { Err(AggregateError::new(self.failures())) }
    }
}

pub struct PruneEngine {
    cluster: Arc<dyn ClusterState>,
    kinds: Vec<Gvk>,
    dry_run: bool,
}

impl PruneEngine {
    pub fn new(cluster: Arc<dyn ClusterState>) -> Self {
        Self { cluster, kinds: Vec::new(), dry_run: false }
    }

    /// Kinds swept for every component even when none of its desired objects have them.
    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = Gvk>) -> Self {
        for gvk in kinds {
            if !self.kinds.iter().any(|k| k.group_kind() == gvk.group_kind()) { self.kinds.push(gvk); }
        }
        self
    }

    pub fn dry_run(mut self, on: bool) -> Self {
        self.dry_run = on;
        self
    }

    pub fn registered_kinds(&self) -> &[Gvk] { &self.kinds }

    fn kinds_for(&self, desired: &ObjectSet) -> SmallVec<[(GroupKind, Gvk); 8]> {
        let mut out = desired.group_kinds();
        for gvk in &self.kinds {
            let gk = gvk.group_kind();
            if !out.iter().any(|(g, _)| *g == gk) { out.push((gk, gvk.clone())); }
        }
        out
    }

    /// Sweep the kinds of `desired` plus the registered kinds. Objects matching
    /// `selector` are deleted unless some component of the pass still desires
    /// them or they belong to a component the pass marked failed.
    pub async fn prune(&self, ctx: &PassContext, desired: &ObjectSet, selector: &LabelSelector) -> PruneReport {
        let mut report = PruneReport::default();
        for (gk, gvk) in self.kinds_for(desired) {
            if !ctx.claim_kind(&gk) {
                debug!(kind = %gk, "kind already swept this pass");
                report.skipped_kinds.push(gk);
                continue;
            }
            counter!("prune_kinds_swept_total", 1u64);
            report.swept_kinds.push(gk.clone());
            let live = match ctx.guard(self.cluster.list(&gvk, selector)).await {
                Ok(v) => v,
                Err(e) => {
                    counter!("prune_err_total", 1u64);
                    warn!(kind = %gk, error = %e, "list failed; kind not swept");
                    report.list_errors.push((gvk, e));
                    continue;
                }
            };
            for obj in live {
                let loose = obj.key().loose();
                if desired.contains(obj.key()) || ctx.is_desired(&loose) { continue; }
                if let Some(comp) = obj.component().filter(|c| ctx.is_failed(c)) {
                    debug!(key = %obj.key(), component = comp, "owner component failed; keeping");
                    continue;
                }
                if self.dry_run {
                    info!(key = %obj.key(), "would prune");
                    report.pruned.push(obj.key().clone());
                    continue;
                }
                match ctx.guard(self.cluster.delete(obj.key())).await {
                    Ok(()) => {}
                    // already gone
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        counter!("prune_err_total", 1u64);
                        warn!(key = %obj.key(), error = %e, "delete failed");
                        report.errors.push(PruneError { key: obj.key().clone(), cause: e });
                        continue;
                    }
                }
                counter!("prune_deleted_total", 1u64);
                info!(key = %obj.key(), "pruned");
                report.pruned.push(obj.key().clone());
            }
        }
        report
    }
}
