//! Converge core types: object model, object sets, selectors, errors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod error;
mod object;
mod set;

pub use error::{AggregateError, ApplyError, ClusterError, Failure, ParseError, PruneError, Stage};
pub use object::{parse_multi, GroupKind, Gvk, K8sObject, LooseKey, ObjectKey};
pub use set::{DuplicateKey, ObjectSet};

/// Names the operator instance that owns an object.
pub const OWNER_LABEL: &str = "converge.io/owner";
/// Names the component that declared an object.
pub const COMPONENT_LABEL: &str = "converge.io/component";
pub const REVISION_LABEL: &str = "converge.io/revision";
/// Content hash written on every successful apply.
pub const HASH_ANNOTATION: &str = "converge.io/content-hash";
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

pub mod prelude {
    pub use super::{
        AggregateError, ApplyError, ClusterError, Failure, GroupKind, Gvk, K8sObject, LabelSelector, ObjectKey, ObjectSet,
        Ownership, ParseError, PruneError, Stage,
    };
}

/// Ownership stamped onto every desired object of a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub owner: String,
    pub component: String,
    pub revision: String,
}

impl Ownership {
    pub fn new(owner: &str, component: &str, revision: &str) -> Self {
        Self { owner: owner.to_string(), component: component.to_string(), revision: revision.to_string() }
    }

    /// Selector matching everything this owner/revision created, across components.
    pub fn owner_selector(owner: &str, revision: &str) -> LabelSelector {
        LabelSelector::new()
            .eq(OWNER_LABEL, owner)
            .eq(REVISION_LABEL, revision)
            .exists(COMPONENT_LABEL)
    }
}

/// Equality + existence label requirements (`a=b,c`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub equals: BTreeMap<String, String>,
    pub exists: Vec<String>,
}

impl LabelSelector {
    pub fn new() -> Self { Self::default() }

    pub fn eq(mut self, key: &str, value: &str) -> Self {
        self.equals.insert(key.to_string(), value.to_string());
        self
    }

    pub fn exists(mut self, key: &str) -> Self {
        if !self.exists.iter().any(|k| k == key) { self.exists.push(key.to_string()); }
        self
    }

    pub fn is_empty(&self) -> bool { self.equals.is_empty() && self.exists.is_empty() }

    pub fn matches<'a>(&self, labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> bool {
        let labels: BTreeMap<&str, &str> = labels.into_iter().collect();
        self.equals.iter().all(|(k, v)| labels.get(k.as_str()) == Some(&v.as_str()))
            && self.exists.iter().all(|k| labels.contains_key(k.as_str()))
    }

    pub fn matches_object(&self, obj: &K8sObject) -> bool { self.matches(obj.labels()) }

    /// Parse `a=b,c` (only equality and existence terms are supported).
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut sel = Self::new();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if term.contains("!=") || term.contains(" in ") || term.starts_with('!') {
                return Err(format!("unsupported selector term: {}", term));
            }
            match term.split_once('=') {
                Some((k, v)) => {
                    let k = k.trim();
                    let v = v.trim_start_matches('=').trim();
                    if k.is_empty() { return Err(format!("empty key in selector term: {}", term)); }
                    sel = sel.eq(k, v);
                }
                None => sel = sel.exists(term),
            }
        }
        Ok(sel)
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (k, v) in &self.equals {
            if !first { f.write_str(",")?; }
            first = false;
            write!(f, "{}={}", k, v)?;
        }
        for k in &self.exists {
            if !first { f.write_str(",")?; }
            first = false;
            f.write_str(k)?;
        }
        Ok(())
    }
}
