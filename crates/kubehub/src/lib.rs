//! Converge kubehub: the cluster-state interface and its implementations.
//!
//! Engines only talk to [`ClusterState`]. [`KubeCluster`] backs it with a live
//! API server through kube-rs; [`MemoryCluster`] is an in-process store used
//! by tests and dry demos. [`PassContext`] carries the per-pass state every
//! worker shares: the deadline that bounds each call and the kinds already swept.

#![forbid(unsafe_code)]

use converge_core::{ClusterError, Gvk, K8sObject, LabelSelector, ObjectKey};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

mod kube_cluster;
mod memory;
mod pass;

pub use kube_cluster::{map_api_status, KubeCluster};
pub use memory::{merge_patch, CallStats, MemoryCluster, PatchRecord};
pub use pass::{PassContext, PrunedKindSet};

/// What a backend can do; probed once per engine lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Server-side apply patches with field ownership.
    pub apply_patch: bool,
    pub dry_run: bool,
}

impl Default for Capabilities {
    fn default() -> Self { Self { apply_patch: true, dry_run: true } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchStrategy {
    /// Ownership-tracking server-side apply.
    Apply,
    /// JSON merge patch (RFC 7386).
    Merge,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOptions {
    /// Take ownership of conflicting fields. Only meaningful for apply patches.
    pub force: bool,
    pub dry_run: bool,
}

/// One mutation of an existing object.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub key: ObjectKey,
    pub strategy: PatchStrategy,
    pub payload: Json,
    pub field_manager: String,
    pub options: PatchOptions,
}

impl Patch {
    pub fn apply(obj: &K8sObject, field_manager: &str, force: bool) -> Self {
        Self {
            key: obj.key().clone(),
            strategy: PatchStrategy::Apply,
            payload: obj.content().clone(),
            field_manager: field_manager.to_string(),
            options: PatchOptions { force, dry_run: false },
        }
    }

    pub fn dry_run(mut self, on: bool) -> Self {
        self.options.dry_run = on;
        self
    }

    /// Rewrite into a merge patch. Apply-only options are dropped.
    pub fn downgrade(mut self) -> Self {
        if self.strategy == PatchStrategy::Apply {
            self.strategy = PatchStrategy::Merge;
            self.options.force = false;
        }
        self
    }

    /// Fit the patch strategy to what the backend supports.
    pub fn for_capabilities(self, caps: &Capabilities) -> Self {
        if caps.apply_patch { self } else { self.downgrade() }
    }
}

/// Options for create calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub field_manager: String,
    pub dry_run: bool,
}

/// Cluster-state interface. Every call is a network round trip for the
/// live implementation; callers bound them with their own deadline.
#[async_trait::async_trait]
pub trait ClusterState: Send + Sync {
    async fn capabilities(&self) -> Result<Capabilities, ClusterError>;

    /// `Ok(None)` when the object does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Option<K8sObject>, ClusterError>;

    /// Fails with `Conflict` if the object already exists.
    async fn create(&self, obj: &K8sObject, opts: &WriteOptions) -> Result<K8sObject, ClusterError>;

    async fn patch(&self, patch: &Patch) -> Result<K8sObject, ClusterError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClusterError>;

    /// All objects of `gvk` matching `selector`, across namespaces.
    async fn list(&self, gvk: &Gvk, selector: &LabelSelector) -> Result<Vec<K8sObject>, ClusterError>;
}
