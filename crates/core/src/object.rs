//! Single cluster resource: identity, ownership metadata, content hash.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};

use crate::error::ParseError;
use crate::{Ownership, COMPONENT_LABEL, HASH_ANNOTATION, LAST_APPLIED_ANNOTATION, OWNER_LABEL, REVISION_LABEL};

fn max_yaml_bytes() -> usize {
    std::env::var("CONVERGE_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("CONVERGE_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Group/Version/Kind. Core kinds have an empty group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Split `apiVersion` on the first `/` (`apps/v1` -> group `apps`, `v1` -> core).
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Self { group, version, kind: kind.to_string() }
    }

    /// Parse a key of the form `v1/Kind` or `group/v1/Kind`.
    pub fn parse_key(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Some(Self::new("", version, kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Some(Self::new(group, version, kind)),
            _ => None,
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind { group: self.group.clone(), kind: self.kind.clone() }
    }
}

impl std::fmt::Display for Gvk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Type identity independent of version; the unit prune sweeps are deduplicated on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: &str, kind: &str) -> Self {
        Self { group: group.to_string(), kind: kind.to_string() }
    }
}

impl std::fmt::Display for GroupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() { write!(f, "{}", self.kind) } else { write!(f, "{}.{}", self.kind, self.group) }
    }
}

/// Identity of one object: (GVK, namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(gvk: Gvk, namespace: Option<&str>, name: &str) -> Self {
        Self { gvk, namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    /// Version-independent identity, used to match live objects against desired ones.
    pub fn loose(&self) -> LooseKey {
        (self.gvk.group_kind(), self.namespace.clone(), self.name.clone())
    }
}

/// `(GroupKind, namespace, name)`.
pub type LooseKey = (GroupKind, Option<String>, String);

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk, ns, self.name),
            None => write!(f, "{} {}", self.gvk, self.name),
        }
    }
}

/// One cluster resource with its raw structured content.
#[derive(Debug, Clone, PartialEq)]
pub struct K8sObject {
    key: ObjectKey,
    content: Json,
}

impl K8sObject {
    /// Parse a single YAML or JSON document.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        if raw.len() > max_yaml_bytes() {
            return Err(ParseError::TooLarge(max_yaml_bytes()));
        }
        let mut docs = yaml_documents(raw)?;
        match docs.len() {
            0 => Err(ParseError::Empty),
            1 => Self::from_value(docs.remove(0)),
            n => Err(ParseError::MultipleDocuments(n)),
        }
    }

    /// Build from an already decoded document, validating kind/name.
    pub fn from_value(content: Json) -> Result<Self, ParseError> {
        if !content.is_object() {
            return Err(ParseError::NotAMapping);
        }
        if json_node_budget_exceeded(&content, max_yaml_nodes()) {
            return Err(ParseError::TooComplex(max_yaml_nodes()));
        }
        let api_version = content.get("apiVersion").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).ok_or(ParseError::MissingApiVersion)?;
        let kind = content.get("kind").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).ok_or(ParseError::MissingKind)?;
        let meta = content.get("metadata");
        let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).filter(|s| !s.is_empty()).ok_or(ParseError::MissingName)?;
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).filter(|s| !s.is_empty());
        let key = ObjectKey::new(Gvk::from_api_version(api_version, kind), namespace, name);
        Ok(Self { key, content })
    }

    pub fn key(&self) -> &ObjectKey { &self.key }

    pub fn gvk(&self) -> &Gvk { &self.key.gvk }

    pub fn name(&self) -> &str { &self.key.name }

    pub fn namespace(&self) -> Option<&str> { self.key.namespace.as_deref() }

    pub fn content(&self) -> &Json { &self.content }

    pub fn into_content(self) -> Json { self.content }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.content).unwrap_or_default()
    }

    /// YAML rendering for logs and test failure output.
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(&self.content).unwrap_or_else(|e| format!("<unrenderable: {}>", e))
    }

    fn meta_map(&self, field: &str) -> impl Iterator<Item = (&str, &str)> {
        self.content
            .get("metadata")
            .and_then(|m| m.get(field))
            .and_then(|v| v.as_object())
            .into_iter()
            .flat_map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.as_str(), s))))
    }

    pub fn labels(&self) -> impl Iterator<Item = (&str, &str)> { self.meta_map("labels") }

    pub fn annotations(&self) -> impl Iterator<Item = (&str, &str)> { self.meta_map("annotations") }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.content.get("metadata")?.get("labels")?.get(key)?.as_str()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.content.get("metadata")?.get("annotations")?.get(key)?.as_str()
    }

    pub fn component(&self) -> Option<&str> { self.label(COMPONENT_LABEL) }

    pub fn revision(&self) -> Option<&str> { self.label(REVISION_LABEL) }

    /// Hash annotation recorded by the last successful apply, if any.
    pub fn stored_hash(&self) -> Option<&str> { self.annotation(HASH_ANNOTATION) }

    fn set_meta(&mut self, field: &str, key: &str, value: &str) {
        // root is always a mapping (checked in from_value)
        let meta = &mut self.content["metadata"];
        if !meta.is_object() { *meta = Json::Object(Default::default()); }
        let entry = &mut meta[field];
        if !entry.is_object() { *entry = Json::Object(Default::default()); }
        entry[key] = Json::String(value.to_string());
    }

    pub fn set_label(&mut self, key: &str, value: &str) { self.set_meta("labels", key, value); }

    pub fn set_annotation(&mut self, key: &str, value: &str) { self.set_meta("annotations", key, value); }

    /// Write ownership labels; must happen before hashing.
    pub fn stamp(&mut self, owner: &Ownership) {
        self.set_label(OWNER_LABEL, &owner.owner);
        self.set_label(COMPONENT_LABEL, &owner.component);
        self.set_label(REVISION_LABEL, &owner.revision);
    }

    /// Content with server-managed fields removed.
    pub fn user_content(&self) -> Json {
        strip_server_fields(self.content.clone())
    }

    /// SHA-256 (hex) over canonical content, excluding server-managed fields.
    /// Field order never affects the result.
    pub fn hash(&self) -> String {
        let canon = canonicalize(&self.user_content());
        let bytes = serde_json::to_vec(&canon).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

impl Serialize for K8sObject {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.content.serialize(s)
    }
}

impl<'de> Deserialize<'de> for K8sObject {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let v = Json::deserialize(d)?;
        K8sObject::from_value(v).map_err(serde::de::Error::custom)
    }
}

/// Split a (possibly multi-document) YAML/JSON stream, skipping empty documents.
fn yaml_documents(raw: &str) -> Result<Vec<Json>, ParseError> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(raw) {
        let val = serde_yaml::Value::deserialize(doc).map_err(|e| ParseError::Syntax(e.to_string()))?;
        if val.is_null() { continue; }
        let json = serde_json::to_value(val).map_err(|e| ParseError::Syntax(e.to_string()))?;
        out.push(json);
    }
    Ok(out)
}

/// Parse every non-empty document of a multi-document stream.
pub fn parse_multi(raw: &str) -> Result<Vec<K8sObject>, ParseError> {
    if raw.len() > max_yaml_bytes() {
        return Err(ParseError::TooLarge(max_yaml_bytes()));
    }
    yaml_documents(raw)?.into_iter().map(K8sObject::from_value).collect()
}

fn strip_server_fields(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("uid");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        if let Some(annos) = meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
            annos.remove(LAST_APPLIED_ANNOTATION);
            annos.remove(HASH_ANNOTATION);
        }
        for field in ["annotations", "labels"] {
            if meta.get(field).and_then(|a| a.as_object()).map(|a| a.is_empty()).unwrap_or(false) {
                meta.remove(field);
            }
        }
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

fn canonicalize(v: &Json) -> Json {
    match v {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k.as_str()]));
            }
            Json::Object(out)
        }
        Json::Array(arr) => Json::Array(arr.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
