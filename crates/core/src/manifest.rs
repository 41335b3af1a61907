//! Desired-state documents and the manifest set of one deploy.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::{split_api_version, ObjectRef, DELETE_ANNOTATION, WAVE_ANNOTATION};

static NAMESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("document is not a mapping")]
    NotAMapping,
    #[error("document missing {0}")]
    MissingField(&'static str),
    #[error("invalid name {name:?} for {kind}")]
    InvalidName { kind: String, name: String },
    #[error("invalid namespace {0:?}")]
    InvalidNamespace(String),
    #[error("invalid {annotation} annotation on {identity}: {value:?}")]
    InvalidAnnotation { identity: ObjectRef, annotation: &'static str, value: String },
    #[error("duplicate resource identity {0}")]
    DuplicateIdentity(ObjectRef),
    #[error("{0}")]
    Parse(String),
}

/// One desired resource document, a generic field tree plus its parsed header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub api_version: String,
    pub group: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub body: Json,
}

impl Document {
    /// Parse the identifying header out of a structured document.
    pub fn from_json(body: Json) -> Result<Self, ManifestError> {
        if !body.is_object() {
            return Err(ManifestError::NotAMapping);
        }
        let api_version = body.get("apiVersion").and_then(|v| v.as_str()).ok_or(ManifestError::MissingField("apiVersion"))?.to_string();
        let kind = body.get("kind").and_then(|v| v.as_str()).ok_or(ManifestError::MissingField("kind"))?.to_string();
        let meta = body.get("metadata");
        let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).ok_or(ManifestError::MissingField("metadata.name"))?.to_string();
        if name.is_empty() || name.len() > 253 || name.contains('/') || name.chars().any(char::is_whitespace) {
            return Err(ManifestError::InvalidName { kind, name });
        }
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).map(str::to_string);
        if let Some(ns) = &namespace {
            validate_namespace(ns)?;
        }
        let (group, _version) = split_api_version(&api_version);
        Ok(Self { api_version, group, kind, name, namespace, body })
    }

    pub fn identity(&self) -> ObjectRef {
        ObjectRef {
            group: self.group.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.body.get("metadata")?.get("annotations")?.get(key)?.as_str()
    }

    /// True when the document carries the deletion marker.
    pub fn marked_for_deletion(&self) -> bool {
        self.annotation(DELETE_ANNOTATION).map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false)
    }

    /// Apply wave from the wave annotation; 0 when absent.
    pub fn wave(&self) -> Result<i32, ManifestError> {
        match self.annotation(WAVE_ANNOTATION) {
            None => Ok(0),
            Some(v) => v.trim().parse::<i32>().map_err(|_| ManifestError::InvalidAnnotation {
                identity: self.identity(),
                annotation: WAVE_ANNOTATION,
                value: v.to_string(),
            }),
        }
    }

    pub fn set_namespace(&mut self, ns: &str) -> Result<(), ManifestError> {
        validate_namespace(ns)?;
        let meta = self.metadata_mut().ok_or(ManifestError::NotAMapping)?;
        meta.insert("namespace".into(), Json::String(ns.to_string()));
        self.namespace = Some(ns.to_string());
        Ok(())
    }

    pub fn clear_namespace(&mut self) {
        if let Some(meta) = self.metadata_mut() {
            meta.remove("namespace");
        }
        self.namespace = None;
    }

    pub fn insert_label(&mut self, key: &str, value: &str) {
        let Some(meta) = self.metadata_mut() else { return };
        let labels = meta.entry("labels").or_insert_with(|| Json::Object(Map::new()));
        if !labels.is_object() {
            *labels = Json::Object(Map::new());
        }
        if let Some(l) = labels.as_object_mut() {
            l.insert(key.to_string(), Json::String(value.to_string()));
        }
    }

    fn metadata_mut(&mut self) -> Option<&mut Map<String, Json>> {
        let meta = self.body.as_object_mut()?.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
        if !meta.is_object() {
            *meta = Json::Object(Map::new());
        }
        meta.as_object_mut()
    }
}

fn validate_namespace(ns: &str) -> Result<(), ManifestError> {
    if ns.len() > 63 || !NAMESPACE_RE.is_match(ns) {
        return Err(ManifestError::InvalidNamespace(ns.to_string()));
    }
    Ok(())
}

/// Ordered collection of desired documents with unique identities.
#[derive(Debug, Clone, Default)]
pub struct ManifestSet {
    docs: Vec<Document>,
    index: HashMap<ObjectRef, usize>,
}

impl ManifestSet {
    pub fn new() -> Self { Self::default() }

    pub fn from_documents(docs: impl IntoIterator<Item = Document>) -> Result<Self, ManifestError> {
        let mut set = Self::new();
        for d in docs {
            set.push(d)?;
        }
        Ok(set)
    }

    /// Append a document; a second document with the same identity is rejected.
    pub fn push(&mut self, doc: Document) -> Result<(), ManifestError> {
        let id = doc.identity();
        if self.index.contains_key(&id) {
            return Err(ManifestError::DuplicateIdentity(id));
        }
        self.index.insert(id, self.docs.len());
        self.docs.push(doc);
        Ok(())
    }

    pub fn get(&self, id: &ObjectRef) -> Option<&Document> {
        self.index.get(id).map(|&i| &self.docs[i])
    }

    pub fn contains(&self, id: &ObjectRef) -> bool { self.index.contains_key(id) }

    pub fn iter(&self) -> impl Iterator<Item = &Document> { self.docs.iter() }

    pub fn documents(&self) -> &[Document] { &self.docs }

    pub fn len(&self) -> usize { self.docs.len() }

    pub fn is_empty(&self) -> bool { self.docs.is_empty() }
}
