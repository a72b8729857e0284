//! Error taxonomy shared by every stage of a reconciliation pass.

use serde::{Deserialize, Serialize};

use crate::ObjectKey;

/// Structural problem with a single object document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty document")]
    Empty,
    #[error("expected a single document, found {0}")]
    MultipleDocuments(usize),
    #[error("document is not a mapping")]
    NotAMapping,
    #[error("missing apiVersion")]
    MissingApiVersion,
    #[error("missing kind")]
    MissingKind,
    #[error("missing metadata.name")]
    MissingName,
    #[error("payload too large (>{0} bytes)")]
    TooLarge(usize),
    #[error("document too complex (>{0} nodes)")]
    TooComplex(usize),
    #[error("syntax: {0}")]
    Syntax(String),
}

/// Failure reported by a cluster-state implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(ObjectKey),
    /// Optimistic-lock race or AlreadyExists on create.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The backend does not support the requested operation (e.g. apply patches).
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("cancelled: pass deadline exceeded or aborted")]
    Cancelled,
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool { matches!(self, ClusterError::NotFound(_)) }

    pub fn is_conflict(&self) -> bool { matches!(self, ClusterError::Conflict(_)) }

    /// Conflicts are the only errors the engines retry on their own.
    pub fn is_retryable(&self) -> bool { self.is_conflict() }
}

/// Create or patch of one object was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("apply {key}: {cause}")]
pub struct ApplyError {
    pub key: ObjectKey,
    #[source]
    pub cause: ClusterError,
}

/// Delete of one orphaned object failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("prune {key}: {cause}")]
pub struct PruneError {
    pub key: ObjectKey,
    #[source]
    pub cause: ClusterError,
}

/// Stage of a pass a failure was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Apply,
    Prune,
    Worker,
}

/// Identity-qualified failure, the unit every error rolls up into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub component: Option<String>,
    /// `None` only for failures not tied to an object (e.g. a crashed worker).
    pub key: Option<ObjectKey>,
    pub stage: Stage,
    pub message: String,
}

impl Failure {
    pub fn component(mut self, name: &str) -> Self {
        self.component = Some(name.to_string());
        self
    }
}

impl From<&ApplyError> for Failure {
    fn from(e: &ApplyError) -> Self {
        Failure { component: None, key: Some(e.key.clone()), stage: Stage::Apply, message: e.cause.to_string() }
    }
}

impl From<&PruneError> for Failure {
    fn from(e: &PruneError) -> Self {
        Failure { component: None, key: Some(e.key.clone()), stage: Stage::Prune, message: e.cause.to_string() }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let comp = self.component.as_deref().unwrap_or("-");
        match &self.key {
            Some(k) => write!(f, "[{}] {:?} {}: {}", comp, self.stage, k, self.message),
            None => write!(f, "[{}] {:?}: {}", comp, self.stage, self.message),
        }
    }
}

/// All failures of a component or pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
pub struct AggregateError {
    pub failures: Vec<Failure>,
}

impl AggregateError {
    pub fn new(failures: Vec<Failure>) -> Self { Self { failures } }

    pub fn is_empty(&self) -> bool { self.failures.is_empty() }

    pub fn len(&self) -> usize { self.failures.len() }

    pub fn push(&mut self, f: Failure) { self.failures.push(f); }

    pub fn extend(&mut self, other: AggregateError) { self.failures.extend(other.failures); }

    /// Ok when nothing failed.
    pub fn into_result(self) -> Result<(), AggregateError> {
        if self.failures.is_empty() { Ok(()) } else { Err(self) }
    }

    /// Whether any failure refers to `key`.
    pub fn names(&self, key: &ObjectKey) -> bool {
        self.failures.iter().any(|f| f.key.as_ref() == Some(key))
    }
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failure(s)", self.failures.len())?;
        for (i, fail) in self.failures.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { ": " } else { "; " }, fail)?;
        }
        Ok(())
    }
}
