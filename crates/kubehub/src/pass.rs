//! Pass-scoped execution context shared by every worker of one reconciliation pass.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use converge_core::{ClusterError, GroupKind, LooseKey};
use rustc_hash::FxHashSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Kinds already swept during the current pass.
#[derive(Debug, Clone, Default)]
pub struct PrunedKindSet(FxHashSet<GroupKind>);

impl PrunedKindSet {
    /// Insert `gk`; false when it was already claimed.
    pub fn claim(&mut self, gk: &GroupKind) -> bool { self.0.insert(gk.clone()) }

    pub fn contains(&self, gk: &GroupKind) -> bool { self.0.contains(gk) }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

#[derive(Default)]
struct Shared {
    pruned: PrunedKindSet,
    failed: FxHashSet<String>,
    progress: usize,
}

/// Built fresh by the orchestrator for every pass and handed to each worker.
/// Never reused: a new pass starts with an empty [`PrunedKindSet`].
pub struct PassContext {
    pass_id: Uuid,
    token: CancellationToken,
    deadline: Option<Instant>,
    desired: FxHashSet<LooseKey>,
    shared: Mutex<Shared>,
}

impl Default for PassContext {
    fn default() -> Self { Self::new() }
}

impl PassContext {
    pub fn new() -> Self {
        Self {
            pass_id: Uuid::new_v4(),
            token: CancellationToken::new(),
            deadline: None,
            desired: FxHashSet::default(),
            shared: Mutex::new(Shared::default()),
        }
    }

    /// Cancel this pass whenever `parent` is cancelled (e.g. on shutdown).
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.token = parent.child_token();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Union of every component's desired keys; sweeps never delete these.
    pub fn with_desired(mut self, keys: impl IntoIterator<Item = LooseKey>) -> Self {
        self.desired.extend(keys);
        self
    }

    pub fn pass_id(&self) -> Uuid { self.pass_id }

    pub fn token(&self) -> &CancellationToken { &self.token }

    pub fn cancel(&self) { self.token.cancel(); }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    pub fn is_desired(&self, key: &LooseKey) -> bool { self.desired.contains(key) }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Test-and-insert under the pass lock. Exactly one caller per kind gets `true`.
    pub fn claim_kind(&self, gk: &GroupKind) -> bool { self.lock().pruned.claim(gk) }

    pub fn pruned_kinds(&self) -> PrunedKindSet { self.lock().pruned.clone() }

    pub fn mark_failed(&self, component: &str) { self.lock().failed.insert(component.to_string()); }

    pub fn is_failed(&self, component: &str) -> bool { self.lock().failed.contains(component) }

    /// Count one more object processed; returns the new total.
    pub fn advance(&self) -> usize {
        let mut s = self.lock();
        s.progress += 1;
        s.progress
    }

    pub fn progress(&self) -> usize { self.lock().progress }

    /// Run a cluster call, aborting it when the pass is cancelled or its deadline passes.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, ClusterError>
    where
        F: Future<Output = Result<T, ClusterError>>,
    {
        if self.is_cancelled() {
            self.token.cancel();
            return Err(ClusterError::Cancelled);
        }
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ClusterError::Cancelled),
            _ = deadline => {
                self.token.cancel();
                Err(ClusterError::Cancelled)
            }
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_kind_is_claimed_once() {
        let ctx = PassContext::new();
        let cm = GroupKind::new("", "ConfigMap");
        assert!(ctx.claim_kind(&cm));
        assert!(!ctx.claim_kind(&cm));
        assert!(ctx.claim_kind(&GroupKind::new("apps", "Deployment")));
        assert_eq!(ctx.pruned_kinds().len(), 2);
        // a new pass starts clean
        assert!(PassContext::new().claim_kind(&cm));
    }

    #[test]
    fn failed_components_and_progress() {
        let ctx = PassContext::new();
        ctx.mark_failed("pilot");
        assert!(ctx.is_failed("pilot"));
        assert!(!ctx.is_failed("gateway"));
        assert_eq!(ctx.advance(), 1);
        assert_eq!(ctx.advance(), 2);
        assert_eq!(ctx.progress(), 2);
    }

    #[tokio::test]
    async fn guard_passes_results_through() {
        let ctx = PassContext::new();
        assert_eq!(ctx.guard(async { Ok::<_, ClusterError>(7) }).await, Ok(7));
        let err = ctx.guard(async { Err::<(), _>(ClusterError::Invalid("x".into())) }).await;
        assert_eq!(err, Err(ClusterError::Invalid("x".into())));
    }

    #[tokio::test]
    async fn guard_aborts_at_deadline() {
        let ctx = PassContext::new().with_timeout(Duration::from_millis(20));
        let slow = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, ClusterError>(())
        };
        assert_eq!(ctx.guard(slow).await, Err(ClusterError::Cancelled));
        assert!(ctx.is_cancelled());
        assert!(ctx.token().is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_the_pass() {
        let parent = CancellationToken::new();
        let ctx = PassContext::new().with_parent(&parent);
        assert!(!ctx.is_cancelled());
        parent.cancel();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.guard(async { Ok::<_, ClusterError>(1) }).await, Err(ClusterError::Cancelled));
    }

    #[tokio::test]
    async fn guard_refuses_after_cancel() {
        let ctx = PassContext::new();
        ctx.cancel();
        assert_eq!(ctx.guard(async { Ok::<_, ClusterError>(1) }).await, Err(ClusterError::Cancelled));
    }
}
