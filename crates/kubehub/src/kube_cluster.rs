//! Live backend: kube-rs `DynamicObject` APIs resolved through discovery.

use std::sync::Mutex;

use converge_core::{ClusterError, Gvk, K8sObject, LabelSelector, ObjectKey};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch as KubePatch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::{Capabilities, ClusterState, Patch, PatchStrategy, WriteOptions};

/// Map an API status code onto the engine's error taxonomy.
pub fn map_api_status(code: u16, message: String, key: Option<&ObjectKey>) -> ClusterError {
    match (code, key) {
        (404, Some(k)) => ClusterError::NotFound(k.clone()),
        (409, _) => ClusterError::Conflict(message),
        // servers without apply support reject the content type
        (415, _) => ClusterError::Unsupported(message),
        (400 | 422, _) => ClusterError::Invalid(message),
        _ => ClusterError::Api { code, message },
    }
}

fn map_kube_err(e: kube::Error, key: Option<&ObjectKey>) -> ClusterError {
    match e {
        kube::Error::Api(ae) => map_api_status(ae.code, ae.message, key),
        other => ClusterError::Transport(other.to_string()),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        obj.remove("managedFields");
    }
}

/// Convert a served object back into the model. List items come without
/// TypeMeta, so apiVersion/kind are filled in from the resource.
fn to_object(obj: &DynamicObject, ar: &ApiResource) -> Result<K8sObject, ClusterError> {
    let mut raw = serde_json::to_value(obj).map_err(|e| ClusterError::Invalid(format!("serializing DynamicObject: {}", e)))?;
    strip_managed_fields(&mut raw);
    if raw.get("kind").and_then(|v| v.as_str()).map(|s| s.is_empty()).unwrap_or(true) {
        raw["apiVersion"] = serde_json::Value::String(ar.api_version.clone());
        raw["kind"] = serde_json::Value::String(ar.kind.clone());
    }
    K8sObject::from_value(raw).map_err(|e| ClusterError::Invalid(format!("served object: {}", e)))
}

fn to_dynamic(obj: &K8sObject) -> Result<DynamicObject, ClusterError> {
    serde_json::from_value(obj.content().clone()).map_err(|e| ClusterError::Invalid(format!("{}: {}", obj.key(), e)))
}

/// Cluster state backed by a live API server.
pub struct KubeCluster {
    client: Client,
    resources: Mutex<FxHashMap<Gvk, (ApiResource, bool)>>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Mutex::new(FxHashMap::default()) }
    }

    /// Client from the current kubeconfig / in-cluster environment.
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    /// Resolve a GVK, re-running discovery on a cache miss so CRDs installed
    /// earlier in the same pass become usable.
    async fn resolve(&self, gvk: &Gvk) -> Result<(ApiResource, bool), ClusterError> {
        let cached = self.resources.lock().unwrap_or_else(|e| e.into_inner()).get(gvk).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(|e| map_kube_err(e, None))?;
        let mut cache = self.resources.lock().unwrap_or_else(|e| e.into_inner());
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    cache.insert(Gvk::new(&ar.group, &ar.version, &ar.kind), (ar, namespaced));
                }
            }
        }
        metrics::counter!("kube_discovery_refresh_total", 1u64);
        debug!(kinds = cache.len(), "discovery cache refreshed");
        cache.get(gvk).cloned().ok_or_else(|| ClusterError::Invalid(format!("GVK not served: {}", gvk)))
    }

    async fn api_for(&self, key: &ObjectKey) -> Result<(Api<DynamicObject>, ApiResource), ClusterError> {
        let (ar, namespaced) = self.resolve(&key.gvk).await?;
        let api = if namespaced {
            match key.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => return Err(ClusterError::Invalid(format!("namespace required for namespaced kind: {}", key))),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok((api, ar))
    }
}

fn parse_version_part(s: &str) -> u32 {
    s.chars().take_while(|c| c.is_ascii_digit()).collect::<String>().parse().unwrap_or(0)
}

#[async_trait::async_trait]
impl ClusterState for KubeCluster {
    async fn capabilities(&self) -> Result<Capabilities, ClusterError> {
        let info = self.client.apiserver_version().await.map_err(|e| map_kube_err(e, None))?;
        let (major, minor) = (parse_version_part(&info.major), parse_version_part(&info.minor));
        let at_least = |m: u32| major > 1 || (major == 1 && minor >= m);
        let caps = Capabilities { apply_patch: at_least(16), dry_run: at_least(13) };
        info!(version = %info.git_version, apply_patch = caps.apply_patch, dry_run = caps.dry_run, "api server capabilities probed");
        Ok(caps)
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<K8sObject>, ClusterError> {
        let (api, ar) = self.api_for(key).await?;
        match api.get_opt(&key.name).await.map_err(|e| map_kube_err(e, Some(key)))? {
            Some(obj) => Ok(Some(to_object(&obj, &ar)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, obj: &K8sObject, opts: &WriteOptions) -> Result<K8sObject, ClusterError> {
        let (api, ar) = self.api_for(obj.key()).await?;
        let pp = PostParams { dry_run: opts.dry_run, field_manager: Some(opts.field_manager.clone()) };
        let created = api.create(&pp, &to_dynamic(obj)?).await.map_err(|e| map_kube_err(e, Some(obj.key())))?;
        to_object(&created, &ar)
    }

    async fn patch(&self, patch: &Patch) -> Result<K8sObject, ClusterError> {
        let (api, ar) = self.api_for(&patch.key).await?;
        let mut pp = match patch.strategy {
            PatchStrategy::Apply => PatchParams::apply(&patch.field_manager),
            PatchStrategy::Merge => PatchParams { field_manager: Some(patch.field_manager.clone()), ..Default::default() },
        };
        if patch.options.force && patch.strategy == PatchStrategy::Apply { pp = pp.force(); }
        if patch.options.dry_run { pp = pp.dry_run(); }
        let res = match patch.strategy {
            PatchStrategy::Apply => api.patch(&patch.key.name, &pp, &KubePatch::Apply(&patch.payload)).await,
            PatchStrategy::Merge => api.patch(&patch.key.name, &pp, &KubePatch::Merge(&patch.payload)).await,
        };
        let obj = res.map_err(|e| map_kube_err(e, Some(&patch.key)))?;
        to_object(&obj, &ar)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        let (api, _) = self.api_for(key).await?;
        api.delete(&key.name, &DeleteParams::background()).await.map_err(|e| map_kube_err(e, Some(key)))?;
        Ok(())
    }

    async fn list(&self, gvk: &Gvk, selector: &LabelSelector) -> Result<Vec<K8sObject>, ClusterError> {
        let (ar, _) = self.resolve(gvk).await?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let mut lp = ListParams::default();
        if !selector.is_empty() { lp = lp.labels(&selector.to_string()); }
        let list = api.list(&lp).await.map_err(|e| map_kube_err(e, None))?;
        list.items.iter().map(|o| to_object(o, &ar)).collect()
    }
}
