//! In-process cluster state with call accounting and fault injection.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use converge_core::{ClusterError, GroupKind, Gvk, K8sObject, LabelSelector, LooseKey, ObjectKey};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value as Json;
use uuid::Uuid;

use crate::{Capabilities, ClusterState, Patch, PatchStrategy, WriteOptions};

/// Apply a JSON merge patch (RFC 7386) in place.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    match patch {
        Json::Object(pm) => {
            if !target.is_object() { *target = Json::Object(Default::default()); }
            if let Json::Object(tm) = target {
                for (k, v) in pm {
                    if v.is_null() {
                        tm.remove(k);
                    } else {
                        merge_patch(tm.entry(k.clone()).or_insert(Json::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    pub key: ObjectKey,
    pub strategy: PatchStrategy,
    pub field_manager: String,
    pub force: bool,
}

/// Calls observed by a [`MemoryCluster`].
#[derive(Debug, Clone, Default)]
pub struct CallStats {
    pub gets: usize,
    pub creates: Vec<ObjectKey>,
    pub patches: Vec<PatchRecord>,
    pub deletes: Vec<ObjectKey>,
    pub lists: BTreeMap<GroupKind, usize>,
    /// Field manager of every create and patch, in call order.
    pub managers: Vec<(ObjectKey, String)>,
}

impl CallStats {
    /// Mutating calls that reached the store (dry runs included).
    pub fn writes(&self) -> usize { self.creates.len() + self.patches.len() + self.deletes.len() }

    pub fn list_calls(&self, gk: &GroupKind) -> usize { self.lists.get(gk).copied().unwrap_or(0) }

    /// Field manager of the last write to `key`.
    pub fn field_manager(&self, key: &ObjectKey) -> Option<&str> {
        self.managers.iter().rev().find(|(k, _)| k == key).map(|(_, m)| m.as_str())
    }
}

#[derive(Default)]
struct Faults {
    reject_writes: FxHashSet<LooseKey>,
    reject_deletes: FxHashSet<LooseKey>,
    conflicts: FxHashMap<LooseKey, u32>,
}

#[derive(Default)]
struct MemState {
    objects: BTreeMap<LooseKey, Json>,
    next_rv: u64,
    stats: CallStats,
    faults: Faults,
}

impl MemState {
    fn take_conflict(&mut self, key: &LooseKey) -> bool {
        match self.faults.conflicts.get_mut(key) {
            Some(n) if *n > 0 => { *n -= 1; true }
            _ => false,
        }
    }

    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

/// Cluster state held in memory. Cluster-scoped and namespaced objects are
/// told apart only by whether the key carries a namespace.
pub struct MemoryCluster {
    state: Mutex<MemState>,
    caps: Capabilities,
    latency: Option<Duration>,
}

impl Default for MemoryCluster {
    fn default() -> Self { Self::new() }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self { state: Mutex::new(MemState::default()), caps: Capabilities::default(), latency: None }
    }

    /// Backend that rejects apply patches, like API servers before 1.16.
    pub fn without_apply_patch(mut self) -> Self {
        self.caps.apply_patch = false;
        self
    }

    pub fn without_dry_run(mut self) -> Self {
        self.caps.dry_run = false;
        self
    }

    /// Delay every call, to exercise deadlines.
    pub fn with_latency(mut self, d: Duration) -> Self {
        self.latency = Some(d);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn delay(&self) {
        if let Some(d) = self.latency { tokio::time::sleep(d).await; }
    }

    /// Seed an object without counting a call.
    pub fn insert(&self, obj: K8sObject) {
        let mut st = self.lock();
        let rv = st.bump_rv();
        let key = obj.key().loose();
        let mut content = obj.into_content();
        content["metadata"]["resourceVersion"] = Json::String(rv);
        st.objects.insert(key, content);
    }

    pub fn object(&self, key: &ObjectKey) -> Option<K8sObject> {
        self.lock().objects.get(&key.loose()).and_then(|v| K8sObject::from_value(v.clone()).ok())
    }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Creates and patches of `key` fail with `Invalid`.
    pub fn reject_writes(&self, key: &ObjectKey) { self.lock().faults.reject_writes.insert(key.loose()); }

    /// Deletes of `key` fail with `Invalid`.
    pub fn reject_deletes(&self, key: &ObjectKey) { self.lock().faults.reject_deletes.insert(key.loose()); }

    /// The next `n` creates/patches of `key` fail with `Conflict`.
    pub fn inject_conflicts(&self, key: &ObjectKey, n: u32) { self.lock().faults.conflicts.insert(key.loose(), n); }

    pub fn stats(&self) -> CallStats { self.lock().stats.clone() }

    pub fn reset_stats(&self) { self.lock().stats = CallStats::default(); }
}

fn to_object(v: &Json) -> Result<K8sObject, ClusterError> {
    K8sObject::from_value(v.clone()).map_err(|e| ClusterError::Invalid(e.to_string()))
}

/// Carry server-populated metadata and status from `live` into `next`.
fn keep_server_fields(next: &mut Json, live: &Json, rv: String) {
    for field in ["uid", "creationTimestamp"] {
        if let Some(v) = live.get("metadata").and_then(|m| m.get(field)) {
            next["metadata"][field] = v.clone();
        }
    }
    if let Some(status) = live.get("status") {
        next["status"] = status.clone();
    }
    next["metadata"]["resourceVersion"] = Json::String(rv);
}

#[async_trait::async_trait]
impl ClusterState for MemoryCluster {
    async fn capabilities(&self) -> Result<Capabilities, ClusterError> {
        Ok(self.caps)
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<K8sObject>, ClusterError> {
        self.delay().await;
        let mut st = self.lock();
        st.stats.gets += 1;
        st.objects.get(&key.loose()).map(to_object).transpose()
    }

    async fn create(&self, obj: &K8sObject, opts: &WriteOptions) -> Result<K8sObject, ClusterError> {
        self.delay().await;
        let mut st = self.lock();
        let key = obj.key().loose();
        st.stats.creates.push(obj.key().clone());
        st.stats.managers.push((obj.key().clone(), opts.field_manager.clone()));
        if opts.dry_run && !self.caps.dry_run {
            return Err(ClusterError::Unsupported("dry run".into()));
        }
        if st.faults.reject_writes.contains(&key) {
            return Err(ClusterError::Invalid(format!("admission rejected {}", obj.key())));
        }
        if st.take_conflict(&key) || st.objects.contains_key(&key) {
            return Err(ClusterError::Conflict(format!("{} already exists", obj.key())));
        }
        let mut content = obj.content().clone();
        content["metadata"]["uid"] = Json::String(Uuid::new_v4().to_string());
        let rv = st.bump_rv();
        content["metadata"]["resourceVersion"] = Json::String(rv);
        if !opts.dry_run {
            st.objects.insert(key, content.clone());
        }
        to_object(&content)
    }

    async fn patch(&self, patch: &Patch) -> Result<K8sObject, ClusterError> {
        self.delay().await;
        let mut st = self.lock();
        let key = patch.key.loose();
        st.stats.patches.push(PatchRecord {
            key: patch.key.clone(),
            strategy: patch.strategy,
            field_manager: patch.field_manager.clone(),
            force: patch.options.force,
        });
        st.stats.managers.push((patch.key.clone(), patch.field_manager.clone()));
        if patch.strategy == PatchStrategy::Apply && !self.caps.apply_patch {
            return Err(ClusterError::Unsupported("apply patch".into()));
        }
        if patch.options.dry_run && !self.caps.dry_run {
            return Err(ClusterError::Unsupported("dry run".into()));
        }
        if st.faults.reject_writes.contains(&key) {
            return Err(ClusterError::Invalid(format!("admission rejected {}", patch.key)));
        }
        if st.take_conflict(&key) {
            return Err(ClusterError::Conflict(format!("{} was modified", patch.key)));
        }
        let live = st.objects.get(&key).cloned().ok_or_else(|| ClusterError::NotFound(patch.key.clone()))?;
        let mut next = match patch.strategy {
            PatchStrategy::Apply => patch.payload.clone(),
            PatchStrategy::Merge => {
                let mut merged = live.clone();
                merge_patch(&mut merged, &patch.payload);
                merged
            }
        };
        let rv = st.bump_rv();
        keep_server_fields(&mut next, &live, rv);
        let out = to_object(&next)?;
        if !patch.options.dry_run {
            st.objects.insert(key, next);
        }
        Ok(out)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        self.delay().await;
        let mut st = self.lock();
        let lk = key.loose();
        st.stats.deletes.push(key.clone());
        if st.faults.reject_deletes.contains(&lk) {
            return Err(ClusterError::Invalid(format!("delete of {} forbidden", key)));
        }
        match st.objects.remove(&lk) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound(key.clone())),
        }
    }

    async fn list(&self, gvk: &Gvk, selector: &LabelSelector) -> Result<Vec<K8sObject>, ClusterError> {
        self.delay().await;
        let mut st = self.lock();
        let gk = gvk.group_kind();
        *st.stats.lists.entry(gk.clone()).or_insert(0) += 1;
        let mut out = Vec::new();
        for ((obj_gk, _, _), v) in st.objects.iter() {
            if *obj_gk != gk { continue; }
            let obj = to_object(v)?;
            if selector.matches_object(&obj) { out.push(obj); }
        }
        Ok(out)
    }
}
