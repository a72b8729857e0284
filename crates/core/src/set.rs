//! Ordered, duplicate-free collection of objects for one component.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::{Gvk, GroupKind, K8sObject, LooseKey, ObjectKey};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("duplicate object {0}")]
pub struct DuplicateKey(pub ObjectKey);

/// Objects in apply (dependency) order. Keys are unique.
#[derive(Debug, Clone, Default)]
pub struct ObjectSet {
    items: Vec<K8sObject>,
    keys: FxHashSet<LooseKey>,
}

impl ObjectSet {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Append, rejecting an identity already present (version is ignored).
    pub fn push(&mut self, obj: K8sObject) -> Result<(), DuplicateKey> {
        if !self.keys.insert(obj.key().loose()) {
            return Err(DuplicateKey(obj.key().clone()));
        }
        self.items.push(obj);
        Ok(())
    }

    pub fn from_objects(objs: impl IntoIterator<Item = K8sObject>) -> Result<Self, DuplicateKey> {
        let mut set = Self::new();
        for o in objs { set.push(o)?; }
        Ok(set)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, K8sObject> { self.items.iter() }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, K8sObject> { self.items.iter_mut() }

    pub fn contains(&self, key: &ObjectKey) -> bool { self.keys.contains(&key.loose()) }

    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> { self.items.iter().map(|o| o.key()) }

    /// Distinct kinds in first-seen order, each with the version it was declared at.
    pub fn group_kinds(&self) -> SmallVec<[(GroupKind, Gvk); 8]> {
        let mut out: SmallVec<[(GroupKind, Gvk); 8]> = SmallVec::new();
        for o in &self.items {
            let gk = o.gvk().group_kind();
            if !out.iter().any(|(g, _)| *g == gk) {
                out.push((gk, o.gvk().clone()));
            }
        }
        out
    }

    /// Stable reorder so cluster-scoped prerequisites land before the workloads
    /// that reference them. Kinds with the same priority keep declared order.
    pub fn sorted_for_install(mut self) -> Self {
        self.items.sort_by_key(|o| install_priority(&o.gvk().kind));
        self
    }
}

fn install_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "Service" => 6,
        "MutatingWebhookConfiguration" | "ValidatingWebhookConfiguration" => 8,
        _ => 7,
    }
}

impl<'a> IntoIterator for &'a ObjectSet {
    type Item = &'a K8sObject;
    type IntoIter = std::slice::Iter<'a, K8sObject>;
    fn into_iter(self) -> Self::IntoIter { self.items.iter() }
}

impl IntoIterator for ObjectSet {
    type Item = K8sObject;
    type IntoIter = std::vec::IntoIter<K8sObject>;
    fn into_iter(self) -> Self::IntoIter { self.items.into_iter() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(api: &str, kind: &str, name: &str) -> K8sObject {
        K8sObject::from_value(serde_json::json!({
            "apiVersion": api, "kind": kind, "metadata": { "name": name, "namespace": "ns" }
        }))
        .unwrap()
    }

    #[test]
    fn rejects_duplicate_identity() {
        let mut set = ObjectSet::new();
        set.push(obj("v1", "ConfigMap", "a")).unwrap();
        set.push(obj("v1", "ConfigMap", "b")).unwrap();
        let err = set.push(obj("v1", "ConfigMap", "a")).unwrap_err();
        assert_eq!(err.0.name, "a");
        // a different version of the same kind is still the same object
        assert!(set.push(obj("v2", "ConfigMap", "b")).is_err());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn group_kinds_in_first_seen_order() {
        let set = ObjectSet::from_objects(vec![
            obj("apps/v1", "Deployment", "d"),
            obj("v1", "ConfigMap", "a"),
            obj("apps/v1", "Deployment", "e"),
        ])
        .unwrap();
        let gks: Vec<String> = set.group_kinds().iter().map(|(gk, _)| gk.to_string()).collect();
        assert_eq!(gks, vec!["Deployment.apps", "ConfigMap"]);
    }

    #[test]
    fn install_order_is_stable() {
        let set = ObjectSet::from_objects(vec![
            obj("apps/v1", "Deployment", "d1"),
            obj("v1", "ConfigMap", "c1"),
            obj("v1", "Namespace", "n"),
            obj("apps/v1", "Deployment", "d0"),
            obj("v1", "ConfigMap", "c0"),
        ])
        .unwrap()
        .sorted_for_install();
        let names: Vec<&str> = set.iter().map(|o| o.name()).collect();
        assert_eq!(names, vec!["n", "c1", "c0", "d1", "d0"]);
        assert!(set.contains(&obj("v1", "ConfigMap", "c0").key().clone()));
    }
}
