//! Manifest loading and materialization against a resolved target.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value as Json;
use skiff_core::{kinds::builtin_scope, Document, ManifestSet, Scope, PROJECT_LABEL, TARGET_LABEL};
use skiff_kubehub::ObjectStore;
use skiff_target::Target;
use tracing::{debug, warn};

use crate::{env_or, DeployError};

fn max_yaml_bytes() -> usize { env_or("SKIFF_MAX_YAML_BYTES", 1_000_000) }

fn max_yaml_nodes() -> usize { env_or("SKIFF_MAX_YAML_NODES", 100_000) }

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
                for vv in arr {
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

/// Split a multi-document YAML stream into documents.
///
/// Empty documents are skipped and `kind: List` is flattened into its items.
pub fn parse_documents(yaml: &str, source: &str) -> Result<Vec<Document>> {
    if yaml.len() > max_yaml_bytes() {
        return Err(anyhow!("{}: YAML payload too large (>{} bytes)", source, max_yaml_bytes()));
    }
    let mut out = Vec::new();
    for (i, de) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(de).with_context(|| format!("{}: parsing YAML document {}", source, i))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).with_context(|| format!("{}: converting YAML document {} to JSON", source, i))?;
        if json_node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(anyhow!("{}: YAML document {} too complex (>{} nodes)", source, i, max_yaml_nodes()));
        }
        if json.get("kind").and_then(|k| k.as_str()) == Some("List") {
            let items = json.get("items").and_then(|i| i.as_array()).cloned().unwrap_or_default();
            for item in items {
                out.push(Document::from_json(item).with_context(|| format!("{}: document {} (List item)", source, i))?);
            }
            continue;
        }
        out.push(Document::from_json(json).with_context(|| format!("{}: document {}", source, i))?);
    }
    Ok(out)
}

/// Load every `*.yaml`/`*.yml` file under `dir`, in path order.
pub fn load_manifests(dir: &Path) -> Result<Vec<Document>> {
    let mut files = Vec::new();
    collect_yaml_files(dir, &mut files).with_context(|| format!("reading manifest directory {}", dir.display()))?;
    files.sort();
    let mut docs = Vec::new();
    for path in files {
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let parsed = parse_documents(&text, &path.display().to_string())?;
        debug!(path = %path.display(), documents = parsed.len(), "loaded manifests");
        docs.extend(parsed);
    }
    Ok(docs)
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let hidden = path.file_name().map(|n| n.to_string_lossy().starts_with('.')).unwrap_or(false);
        if hidden {
            continue;
        }
        if path.is_dir() {
            collect_yaml_files(&path, out)?;
        } else if matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")) {
            out.push(path);
        }
    }
    Ok(())
}

/// Bind rendered documents to `target`: default namespaces, ownership labels
/// and identity validation.
pub async fn materialize(documents: Vec<Document>, target: &Target, store: &dyn ObjectStore) -> Result<ManifestSet, DeployError> {
    let mut scopes: HashMap<(String, String), Scope> = HashMap::new();
    let mut set = ManifestSet::new();
    for mut doc in documents {
        let key = (doc.group.clone(), doc.kind.clone());
        let scope = match scopes.get(&key) {
            Some(s) => *s,
            None => {
                let s = match store.scope(&doc.group, &doc.kind).await {
                    Ok(s) => s,
                    Err(e) if e.is_fatal() => return Err(DeployError::Fatal(e)),
                    Err(e) => {
                        warn!(kind = %doc.kind, group = %doc.group, error = %e, "scope lookup failed, using builtin table");
                        builtin_scope(&doc.group, &doc.kind)
                    }
                };
                scopes.insert(key, s);
                s
            }
        };
        match scope {
            Scope::Cluster => doc.clear_namespace(),
            Scope::Namespaced if doc.namespace.is_none() => doc.set_namespace(&target.namespace)?,
            Scope::Namespaced => {}
        }
        doc.wave()?;
        doc.insert_label(PROJECT_LABEL, &target.project);
        doc.insert_label(TARGET_LABEL, &target.name);
        set.push(doc)?;
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::{ManifestError, ObjectRef};
    use skiff_kubehub::{ClusterContext, MemoryStore, Op, StoreError};
    use std::collections::BTreeMap;

    fn target() -> Target {
        Target { project: "simple".into(), name: "test".into(), context: ClusterContext::new(None), namespace: "simple".into(), args: BTreeMap::new() }
    }

    #[test]
    fn parse_errors_are_friendly() {
        let e1 = format!("{:#}", parse_documents("kind: Foo\nmetadata:\n  name: x\n", "a.yaml").unwrap_err());
        assert!(e1.contains("missing apiVersion"), "e1={}", e1);
        let e2 = format!("{:#}", parse_documents("apiVersion: v1\nmetadata:\n  name: x\n", "a.yaml").unwrap_err());
        assert!(e2.contains("missing kind"), "e2={}", e2);
        let e3 = format!("{:#}", parse_documents("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n", "a.yaml").unwrap_err());
        assert!(e3.contains("missing metadata.name"), "e3={}", e3);
    }

    #[test]
    fn multi_document_streams_and_lists() {
        let yaml = "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\n---\napiVersion: v1\nkind: List\nitems:\n  - apiVersion: v1\n    kind: ConfigMap\n    metadata:\n      name: b\n  - apiVersion: v1\n    kind: Secret\n    metadata:\n      name: c\n";
        let docs = parse_documents(yaml, "x.yaml").unwrap();
        let names: Vec<&str> = docs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn node_budget() {
        let v = serde_json::json!({"a": [1, 2, 3], "b": {"c": 1}});
        assert!(!json_node_budget_exceeded(&v, 100));
        assert!(json_node_budget_exceeded(&v, 3));
    }

    #[test]
    fn loads_directory_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b.yml"), "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: second\n").unwrap();
        std::fs::write(dir.path().join("a.yaml"), "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: first\n").unwrap();
        std::fs::write(dir.path().join("nested/c.yaml"), "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: third\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not yaml").unwrap();
        let docs = load_manifests(dir.path()).unwrap();
        let names: Vec<&str> = docs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn materialize_binds_documents_to_target() {
        let store = MemoryStore::new();
        let docs = parse_documents(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: simple\n  namespace: bogus\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: other\n  namespace: kube-public\n",
            "x.yaml",
        )
        .unwrap();
        let set = materialize(docs, &target(), &store).await.unwrap();
        assert!(set.contains(&ObjectRef::new("", "ConfigMap", Some("simple"), "cm")));
        assert!(set.contains(&ObjectRef::new("", "Namespace", None, "simple")));
        assert!(set.contains(&ObjectRef::new("", "ConfigMap", Some("kube-public"), "other")));
        let cm = set.get(&ObjectRef::new("", "ConfigMap", Some("simple"), "cm")).unwrap();
        assert_eq!(cm.body["metadata"]["labels"][PROJECT_LABEL], "simple");
        assert_eq!(cm.body["metadata"]["labels"][TARGET_LABEL], "test");
        assert_eq!(cm.body["metadata"]["namespace"], "simple");
    }

    #[tokio::test]
    async fn materialize_rejects_duplicates_and_bad_waves() {
        let store = MemoryStore::new();
        let dup = parse_documents("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: simple\n", "x").unwrap();
        let err = materialize(dup, &target(), &store).await.unwrap_err();
        assert!(matches!(err, DeployError::Manifest(ManifestError::DuplicateIdentity(_))));

        let wave = parse_documents("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  annotations:\n    skiff.dev/wave: soon\n", "x").unwrap();
        let err = materialize(wave, &target(), &store).await.unwrap_err();
        assert!(matches!(err, DeployError::Manifest(ManifestError::InvalidAnnotation { .. })));
        assert_eq!(store.calls(Op::Apply), 0);
    }

    #[tokio::test]
    async fn fatal_scope_lookup_aborts() {
        struct Denied;
        #[async_trait::async_trait]
        impl ObjectStore for Denied {
            async fn scope(&self, _: &str, _: &str) -> Result<Scope, StoreError> { Err(StoreError::Fatal("forbidden".into())) }
            async fn get(&self, id: &ObjectRef) -> Result<skiff_core::LiveObject, StoreError> { Err(StoreError::NotFound(id.to_string())) }
            fn list<'a>(&'a self, _: &'a skiff_core::LabelSelector) -> futures::stream::BoxStream<'a, Result<skiff_core::LiveObject, StoreError>> {
                Box::pin(futures::stream::empty())
            }
            async fn apply(&self, _: &ObjectRef, _: &Document, _: Option<&str>, _: &skiff_kubehub::ApplyOptions) -> Result<skiff_core::LiveObject, StoreError> {
                Err(StoreError::Fatal("forbidden".into()))
            }
            async fn delete(&self, _: &ObjectRef, _: Option<&str>) -> Result<(), StoreError> { Err(StoreError::Fatal("forbidden".into())) }
        }
        let docs = parse_documents("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n", "x").unwrap();
        let err = materialize(docs, &target(), &Denied).await.unwrap_err();
        assert!(matches!(err, DeployError::Fatal(_)));
    }
}
