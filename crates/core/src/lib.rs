//! Skiff core types: resource identities, generic documents and ownership markers.
//!
//! Everything that crosses crate boundaries (manifest sets, deltas, deploy
//! results) lives here so that the store, diff and apply crates agree on
//! one vocabulary.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod delta;
pub mod kinds;
pub mod manifest;
pub mod result;

pub use delta::{Change, Delta, DeltaAction, FieldChange, FieldPatch, FieldPath, PatchOp, PathSegment};
pub use manifest::{Document, ManifestError, ManifestSet};
pub use result::{DeployResult, OrphanOutcome, OrphanStatus, OutcomeStatus, ResourceOutcome, Summary};

/// Field manager name used for server-side apply.
pub const FIELD_MANAGER: &str = "skiff";

/// Ownership label naming the project that deployed an object.
pub const PROJECT_LABEL: &str = "skiff.dev/project";
/// Ownership label naming the target that deployed an object.
pub const TARGET_LABEL: &str = "skiff.dev/target";
/// Annotation marking a desired document for removal (`"true"`).
pub const DELETE_ANNOTATION: &str = "skiff.dev/delete";
/// Annotation carrying the apply wave (integer, lower waves go first).
pub const WAVE_ANNOTATION: &str = "skiff.dev/wave";

pub mod prelude {
    pub use super::{
        Change, Delta, DeltaAction, DeployResult, Document, FieldPatch, ManifestSet, ObjectRef,
        OutcomeStatus, Scope,
    };
}

/// Identity key of a resource: `(group, kind, namespace, name)`.
///
/// The API version is deliberately not part of the identity: the same object
/// can be served under several versions of its group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    /// API group, empty for the core group.
    pub group: String,
    pub kind: String,
    /// `None` for cluster-scoped resources.
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(group: impl Into<String>, kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Same identity with the namespace dropped (cluster-scoped form).
    pub fn cluster_scoped(mut self) -> Self {
        self.namespace = None;
        self
    }

    /// `group/kind` key used for scope lookups.
    pub fn group_kind(&self) -> String {
        if self.group.is_empty() { self.kind.clone() } else { format!("{}/{}", self.group, self.kind) }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gk = self.group_kind();
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", gk, ns, self.name),
            None => write!(f, "{}/{}", gk, self.name),
        }
    }
}

/// Whether a kind lives inside a namespace or at cluster level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// Split an `apiVersion` into `(group, version)`; the core group is empty.
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Selector over ownership labels, rendered as `k=v,k2=v2` for the API server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub match_labels: Vec<(String, String)>,
}

impl LabelSelector {
    /// Selector matching objects deployed by `project` to `target`.
    pub fn ownership(project: &str, target: &str) -> Self {
        Self {
            match_labels: vec![
                (PROJECT_LABEL.to_string(), project.to_string()),
                (TARGET_LABEL.to_string(), target.to_string()),
            ],
        }
    }

    pub fn matches(&self, labels: Option<&serde_json::Map<String, Json>>) -> bool {
        self.match_labels.iter().all(|(k, v)| {
            labels.and_then(|l| l.get(k)).and_then(|x| x.as_str()) == Some(v.as_str())
        })
    }

    pub fn matches_object(&self, obj: &Json) -> bool {
        let labels = obj.get("metadata").and_then(|m| m.get("labels")).and_then(|l| l.as_object());
        self.matches(labels)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.match_labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        f.write_str(&parts.join(","))
    }
}

/// Current state of a resource as read from the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveObject {
    pub identity: ObjectRef,
    /// Optimistic concurrency token.
    pub resource_version: String,
    pub uid: Option<String>,
    pub body: Json,
}

impl LiveObject {
    /// Build from a raw object body read under a known identity.
    pub fn from_body(identity: ObjectRef, body: Json) -> Self {
        let meta = body.get("metadata");
        let resource_version = meta
            .and_then(|m| m.get("resourceVersion"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let uid = meta.and_then(|m| m.get("uid")).and_then(|v| v.as_str()).map(str::to_string);
        Self { identity, resource_version, uid, body }
    }

    pub fn labels(&self) -> Option<&serde_json::Map<String, Json>> {
        self.body.get("metadata").and_then(|m| m.get("labels")).and_then(|l| l.as_object())
    }
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
