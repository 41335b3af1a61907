//! In-process object store with resource versions and fault injection.
//!
//! Behaves like a tiny API server: monotonically increasing resource versions,
//! uid/creationTimestamp assignment, server-side-apply style merging and
//! label-selector listing. Tests use the fault and drift hooks to exercise the
//! reconciler's error paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use serde_json::{Map, Value as Json};
use skiff_core::{kinds::builtin_scope, Document, LabelSelector, LiveObject, ObjectRef, Scope};
use tracing::trace;
use uuid::Uuid;

use crate::{ApplyMode, ApplyOptions, ClusterContext, Connector, ObjectStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    List,
    Apply,
    Delete,
}

#[derive(Debug)]
struct Fault {
    op: Op,
    /// `None` matches any identity.
    identity: Option<ObjectRef>,
    error: StoreError,
    remaining: usize,
}

#[derive(Debug, Default)]
struct MemState {
    objects: BTreeMap<ObjectRef, Json>,
    last_rv: u64,
    mutations: u64,
    calls: HashMap<Op, usize>,
    faults: Vec<Fault>,
    /// identity -> gets left before an external writer bumps it
    drift: Vec<(ObjectRef, usize)>,
    scopes: HashMap<(String, String), Scope>,
}

impl MemState {
    fn next_rv(&mut self) -> String {
        self.last_rv += 1;
        self.last_rv.to_string()
    }

    fn take_fault(&mut self, op: Op, id: Option<&ObjectRef>) -> Option<StoreError> {
        let pos = self.faults.iter().position(|f| f.op == op && (f.identity.is_none() || f.identity.as_ref() == id))?;
        let fault = &mut self.faults[pos];
        let err = fault.error.clone();
        fault.remaining -= 1;
        if fault.remaining == 0 {
            self.faults.remove(pos);
        }
        Some(err)
    }

    fn bump(&mut self, id: &ObjectRef) {
        let rv = self.next_rv();
        if let Some(meta) = self.objects.get_mut(id).and_then(|o| o.get_mut("metadata")).and_then(|m| m.as_object_mut()) {
            meta.insert("resourceVersion".into(), Json::String(rv));
            self.mutations += 1;
        }
    }
}

/// Shared in-memory store; clones see the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemState>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, MemState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed an object as if another actor had created it.
    pub fn insert(&self, body: Json) -> Result<LiveObject, StoreError> {
        let doc = Document::from_json(body).map_err(|e| StoreError::Rejected(e.to_string()))?;
        let mut id = doc.identity();
        if self.scope_of(&id.group, &id.kind) == Scope::Cluster {
            id = id.cluster_scoped();
        }
        let mut st = self.state();
        let rv = st.next_rv();
        let body = stamp(doc.body, &id, None, &rv);
        st.objects.insert(id.clone(), body.clone());
        st.mutations += 1;
        Ok(LiveObject::from_body(id, body))
    }

    /// Mutate a live object out of band; bumps its resource version.
    pub fn modify(&self, id: &ObjectRef, f: impl FnOnce(&mut Json)) -> bool {
        let mut st = self.state();
        let Some(obj) = st.objects.get_mut(id) else { return false };
        f(obj);
        st.bump(id);
        true
    }

    /// Bump the resource version without changing content.
    pub fn touch(&self, id: &ObjectRef) -> bool {
        self.modify(id, |_| {})
    }

    /// Fail the next `times` calls of `op` (for `identity`, or any when `None`).
    pub fn inject(&self, op: Op, identity: Option<ObjectRef>, error: StoreError, times: usize) {
        if times == 0 {
            return;
        }
        self.state().faults.push(Fault { op, identity, error, remaining: times });
    }

    /// After `gets` successful reads of `identity`, simulate a concurrent writer.
    pub fn drift_after_gets(&self, identity: ObjectRef, gets: usize) {
        self.state().drift.push((identity, gets));
    }

    pub fn set_scope(&self, group: &str, kind: &str, scope: Scope) {
        self.state().scopes.insert((group.to_string(), kind.to_string()), scope);
    }

    pub fn get_body(&self, id: &ObjectRef) -> Option<Json> {
        self.state().objects.get(id).cloned()
    }

    pub fn contains(&self, id: &ObjectRef) -> bool {
        self.state().objects.contains_key(id)
    }

    /// Copy of every stored object, for before/after comparisons.
    pub fn snapshot(&self) -> BTreeMap<ObjectRef, Json> {
        self.state().objects.clone()
    }

    /// Number of writes performed so far.
    pub fn mutations(&self) -> u64 { self.state().mutations }

    pub fn calls(&self, op: Op) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    fn scope_of(&self, group: &str, kind: &str) -> Scope {
        let st = self.state();
        st.scopes.get(&(group.to_string(), kind.to_string())).copied().unwrap_or_else(|| builtin_scope(group, kind))
    }
}

/// Write server-populated metadata into `body`.
fn stamp(mut body: Json, id: &ObjectRef, prev: Option<&Json>, rv: &str) -> Json {
    let prev_meta = prev.and_then(|p| p.get("metadata"));
    let uid = prev_meta
        .and_then(|m| m.get("uid"))
        .cloned()
        .unwrap_or_else(|| Json::String(Uuid::new_v4().to_string()));
    let created = prev_meta
        .and_then(|m| m.get("creationTimestamp"))
        .cloned()
        .unwrap_or_else(|| Json::String(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()));
    if let Some(root) = body.as_object_mut() {
        let meta = root.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
        if let Some(m) = meta.as_object_mut() {
            m.insert("name".into(), Json::String(id.name.clone()));
            match &id.namespace {
                Some(ns) => { m.insert("namespace".into(), Json::String(ns.clone())); }
                None => { m.remove("namespace"); }
            }
            m.insert("uid".into(), uid);
            m.insert("creationTimestamp".into(), created);
            m.insert("resourceVersion".into(), Json::String(rv.to_string()));
        }
    }
    body
}

/// Server-side-apply style merge: mappings merge recursively, `null` removes,
/// everything else (including sequences) is replaced.
fn merge_into(live: &mut Json, desired: &Json) {
    match (live, desired) {
        (Json::Object(lo), Json::Object(dobj)) => {
            for (k, dv) in dobj {
                if dv.is_null() {
                    lo.remove(k);
                    continue;
                }
                match lo.get_mut(k) {
                    Some(lv) if lv.is_object() && dv.is_object() => merge_into(lv, dv),
                    _ => { lo.insert(k.clone(), dv.clone()); }
                }
            }
        }
        (live, desired) => *live = desired.clone(),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn scope(&self, group: &str, kind: &str) -> Result<Scope, StoreError> {
        Ok(self.scope_of(group, kind))
    }

    async fn get(&self, id: &ObjectRef) -> Result<LiveObject, StoreError> {
        let mut st = self.state();
        *st.calls.entry(Op::Get).or_default() += 1;
        if let Some(err) = st.take_fault(Op::Get, Some(id)) {
            return Err(err);
        }
        let body = st.objects.get(id).cloned().ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if let Some(pos) = st.drift.iter().position(|(d, _)| d == id) {
            st.drift[pos].1 = st.drift[pos].1.saturating_sub(1);
            if st.drift[pos].1 == 0 {
                st.drift.remove(pos);
                st.bump(id);
                trace!(%id, "simulated concurrent write");
            }
        }
        Ok(LiveObject::from_body(id.clone(), body))
    }

    fn list<'a>(&'a self, selector: &'a LabelSelector) -> BoxStream<'a, Result<LiveObject, StoreError>> {
        futures::stream::once(async move {
            let mut st = self.state();
            *st.calls.entry(Op::List).or_default() += 1;
            if let Some(err) = st.take_fault(Op::List, None) {
                return vec![Err(err)];
            }
            st.objects
                .iter()
                .filter(|(_, body)| selector.matches_object(body))
                .map(|(id, body)| Ok(LiveObject::from_body(id.clone(), body.clone())))
                .collect::<Vec<_>>()
        })
        .flat_map(futures::stream::iter)
        .boxed()
    }

    async fn apply(&self, id: &ObjectRef, doc: &Document, expected_rv: Option<&str>, opts: &ApplyOptions) -> Result<LiveObject, StoreError> {
        let mut st = self.state();
        *st.calls.entry(Op::Apply).or_default() += 1;
        if let Some(err) = st.take_fault(Op::Apply, Some(id)) {
            return Err(err);
        }
        let prev = st.objects.get(id).cloned();
        if let Some(expected) = expected_rv {
            let current = prev.as_ref().and_then(|p| p.get("metadata")).and_then(|m| m.get("resourceVersion")).and_then(|v| v.as_str());
            if current != Some(expected) {
                return Err(StoreError::Conflict(format!(
                    "{}: resource version {} expected, found {}",
                    id,
                    expected,
                    current.unwrap_or("<absent>")
                )));
            }
        }
        let mut desired = doc.body.clone();
        if let Some(meta) = desired.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("resourceVersion");
        }
        let merged = match (&prev, opts.mode) {
            (Some(live), ApplyMode::ServerSide) => {
                let mut live = live.clone();
                merge_into(&mut live, &desired);
                live
            }
            _ => desired,
        };
        let rv = st.next_rv();
        let body = stamp(merged, id, prev.as_ref(), &rv);
        st.objects.insert(id.clone(), body.clone());
        st.mutations += 1;
        Ok(LiveObject::from_body(id.clone(), body))
    }

    async fn delete(&self, id: &ObjectRef, expected_rv: Option<&str>) -> Result<(), StoreError> {
        let mut st = self.state();
        *st.calls.entry(Op::Delete).or_default() += 1;
        if let Some(err) = st.take_fault(Op::Delete, Some(id)) {
            return Err(err);
        }
        let Some(prev) = st.objects.get(id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        if let Some(expected) = expected_rv {
            let current = prev.get("metadata").and_then(|m| m.get("resourceVersion")).and_then(|v| v.as_str());
            if current != Some(expected) {
                return Err(StoreError::Conflict(format!("{}: delete precondition failed", id)));
            }
        }
        st.objects.remove(id);
        st.mutations += 1;
        Ok(())
    }
}

impl Connector for MemoryStore {
    fn connect(&self, _ctx: &ClusterContext) -> Arc<dyn ObjectStore> {
        Arc::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;

    fn cm_doc(name: &str, data: Json) -> Document {
        Document::from_json(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "ns", "labels": {"skiff.dev/project": "p", "skiff.dev/target": "t"}},
            "data": data,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn apply_creates_then_merges() {
        let store = MemoryStore::new();
        let doc = cm_doc("cm", json!({"a": "1"}));
        let id = doc.identity();
        let created = store.apply(&id, &doc, None, &ApplyOptions::default()).await.unwrap();
        assert_eq!(created.resource_version, "1");
        assert!(created.uid.is_some());

        // another actor adds a field we do not manage
        store.modify(&id, |o| { o["data"]["foreign"] = json!("x"); });
        let live = store.get(&id).await.unwrap();
        let doc2 = cm_doc("cm", json!({"a": "2"}));
        let merged = store.apply(&id, &doc2, Some(&live.resource_version), &ApplyOptions::default()).await.unwrap();
        assert_eq!(merged.body["data"]["a"], "2");
        assert_eq!(merged.body["data"]["foreign"], "x");
        assert_eq!(merged.uid, created.uid);
    }

    #[tokio::test]
    async fn replace_mode_drops_undeclared_fields() {
        let store = MemoryStore::new();
        let doc = cm_doc("cm", json!({"a": "1", "b": "2"}));
        let id = doc.identity();
        let live = store.apply(&id, &doc, None, &ApplyOptions::default()).await.unwrap();
        let opts = ApplyOptions { mode: ApplyMode::Replace, force_conflicts: false };
        let replaced = store.apply(&id, &cm_doc("cm", json!({"a": "1"})), Some(&live.resource_version), &opts).await.unwrap();
        assert!(replaced.body["data"].get("b").is_none());
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = MemoryStore::new();
        let doc = cm_doc("cm", json!({"a": "1"}));
        let id = doc.identity();
        let live = store.apply(&id, &doc, None, &ApplyOptions::default()).await.unwrap();
        store.touch(&id);
        let err = store.apply(&id, &doc, Some(&live.resource_version), &ApplyOptions::default()).await.unwrap_err();
        assert!(err.is_conflict());
        let err = store.delete(&id, Some(&live.resource_version)).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = MemoryStore::new();
        let id = ObjectRef::new("", "ConfigMap", Some("ns"), "nope");
        assert!(store.delete(&id, None).await.unwrap_err().is_not_found());
        assert!(store.get_opt(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_by_selector_and_reflects_current_state() {
        let store = MemoryStore::new();
        let doc = cm_doc("owned", json!({}));
        store.apply(&doc.identity(), &doc, None, &ApplyOptions::default()).await.unwrap();
        store.insert(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "foreign", "namespace": "ns"}})).unwrap();
        let sel = LabelSelector::ownership("p", "t");

        let first: Vec<LiveObject> = store.list(&sel).try_collect().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].identity.name, "owned");

        store.delete(&doc.identity(), None).await.unwrap();
        let second: Vec<LiveObject> = store.list(&sel).try_collect().await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn faults_fire_the_requested_number_of_times() {
        let store = MemoryStore::new();
        let id = ObjectRef::new("", "ConfigMap", Some("ns"), "cm");
        store.inject(Op::Get, Some(id.clone()), StoreError::Transient("timeout".into()), 2);
        assert!(store.get(&id).await.unwrap_err().is_transient());
        assert!(store.get(&id).await.unwrap_err().is_transient());
        assert!(store.get(&id).await.unwrap_err().is_not_found());
        assert_eq!(store.calls(Op::Get), 3);
    }

    #[tokio::test]
    async fn drift_bumps_version_after_reads() {
        let store = MemoryStore::new();
        let live = store.insert(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm", "namespace": "ns"}})).unwrap();
        store.drift_after_gets(live.identity.clone(), 1);
        let seen = store.get(&live.identity).await.unwrap();
        assert_eq!(seen.resource_version, live.resource_version);
        let now = store.get(&live.identity).await.unwrap();
        assert_ne!(now.resource_version, seen.resource_version);
    }

    #[test]
    fn cluster_scoped_insert_drops_namespace() {
        let store = MemoryStore::new();
        let live = store.insert(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "simple", "namespace": "x"}})).unwrap();
        assert_eq!(live.identity.namespace, None);
        assert!(live.body["metadata"].get("namespace").is_none());
    }
}
