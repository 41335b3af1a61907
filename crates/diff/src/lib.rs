//! Skiff diff engine: turns a manifest set plus live cluster state into deltas.
//!
//! Reads fan out concurrently, bounded by [`DiffOptions::workers`]; the
//! returned plan is always in manifest order. Nothing here writes.

#![forbid(unsafe_code)]

use std::time::Instant;

use futures::{StreamExt, TryStreamExt};
use metrics::{counter, histogram};
use serde::Serialize;
use skiff_core::{Change, Delta, Document, LabelSelector, LiveObject, ManifestSet, ObjectRef};
use skiff_kubehub::{retry_transient, ObjectStore, RetryPolicy, StoreError};
use skiff_target::Target;
use tracing::{debug, info, warn};

mod patch;

pub use patch::{compute_field_patch, strip_noisy, MergePolicy};

pub const DEFAULT_WORKERS: usize = 16;

#[derive(Debug, Clone)]
pub struct DiffOptions {
    pub policy: MergePolicy,
    /// Maximum concurrent reads.
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self { policy: MergePolicy::default(), workers: DEFAULT_WORKERS, retry: RetryPolicy::default() }
    }
}

/// A live object carrying the ownership labels whose identity is not in the
/// manifest set. `resource_version` is the delete precondition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Orphan {
    pub identity: ObjectRef,
    pub resource_version: String,
}

/// A delta together with what the reconciler needs to apply it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedDelta {
    pub delta: Delta,
    /// Resource version seen while diffing; the apply precondition.
    pub observed_rv: Option<String>,
    pub wave: i32,
}

#[derive(Debug, Default)]
pub struct DiffOutcome {
    /// One entry per readable document, in manifest order.
    pub planned: Vec<PlannedDelta>,
    /// Documents whose live state could not be read.
    pub errors: Vec<(ObjectRef, StoreError)>,
    pub orphans: Vec<Orphan>,
    pub warnings: Vec<String>,
}

impl DiffOutcome {
    pub fn deltas(&self) -> impl Iterator<Item = &Delta> {
        self.planned.iter().map(|p| &p.delta)
    }

    /// Deltas that would touch the cluster.
    pub fn changes(&self) -> impl Iterator<Item = &Delta> {
        self.deltas().filter(|d| !d.change.is_noop())
    }
}

/// Decide the change for `doc` given its live counterpart.
pub fn plan_for(doc: &Document, live: Option<&LiveObject>, policy: MergePolicy) -> PlannedDelta {
    let change = match (live, doc.marked_for_deletion()) {
        (None, true) => Change::Noop,
        (None, false) => Change::Create,
        (Some(_), true) => Change::Delete,
        (Some(live), false) => {
            let patch = compute_field_patch(&doc.body, &live.body, policy);
            if patch.is_empty() { Change::Noop } else { Change::Update(patch) }
        }
    };
    PlannedDelta {
        delta: Delta::new(doc.identity(), change),
        observed_rv: live.map(|l| l.resource_version.clone()),
        wave: doc.wave().unwrap_or_default(),
    }
}

/// Read the live state of one document and plan its delta.
pub async fn diff_one(doc: &Document, store: &dyn ObjectStore, opts: &DiffOptions) -> Result<PlannedDelta, StoreError> {
    let id = doc.identity();
    let live = retry_transient(&opts.retry, "get", || store.get_opt(&id)).await?;
    let planned = plan_for(doc, live.as_ref(), opts.policy);
    debug!(%id, action = %planned.delta.action(), rv = ?planned.observed_rv, "diffed");
    Ok(planned)
}

/// Diff every document of `set` and detect orphans of `target`.
///
/// Per-resource read failures land in [`DiffOutcome::errors`]; the first
/// fatal one aborts the whole pass and drops the reads still in flight.
pub async fn compute_deltas(set: &ManifestSet, target: &Target, store: &dyn ObjectStore, opts: &DiffOptions) -> Result<DiffOutcome, StoreError> {
    let t0 = Instant::now();
    let mut results: Vec<(usize, ObjectRef, Result<PlannedDelta, StoreError>)> = futures::stream::iter(set.iter().enumerate())
        .map(|(i, doc)| async move { (i, doc.identity(), diff_one(doc, store, opts).await) })
        .buffer_unordered(opts.workers.max(1))
        .map(|(i, id, res)| match res {
            Err(e) if e.is_fatal() => Err(e),
            other => Ok((i, id, other)),
        })
        .try_collect()
        .await
        .map_err(|e| {
            counter!("diff_fatal", 1u64);
            e
        })?;
    results.sort_by_key(|(i, _, _)| *i);

    let mut outcome = DiffOutcome::default();
    for (_, id, res) in results {
        match res {
            Ok(p) => outcome.planned.push(p),
            Err(e) => {
                warn!(%id, error = %e, "reading live state failed");
                counter!("diff_read_err", 1u64);
                outcome.errors.push((id, e));
            }
        }
    }

    let selector = LabelSelector::ownership(&target.project, &target.name);
    match find_orphans(set, &selector, store, &opts.retry).await {
        Ok(orphans) => outcome.orphans = orphans,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            warn!(selector = %selector, error = %e, "orphan detection skipped");
            outcome.warnings.push(format!("orphan detection skipped: {}", e));
        }
    }

    histogram!("diff_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    info!(
        target = %target.name,
        documents = set.len(),
        changes = outcome.changes().count(),
        errors = outcome.errors.len(),
        orphans = outcome.orphans.len(),
        took_ms = %t0.elapsed().as_millis(),
        "diff done"
    );
    Ok(outcome)
}

/// Live objects carrying the ownership labels whose identity is not in `set`.
async fn find_orphans(set: &ManifestSet, selector: &LabelSelector, store: &dyn ObjectStore, retry: &RetryPolicy) -> Result<Vec<Orphan>, StoreError> {
    let live: Vec<LiveObject> = retry_transient(retry, "list", || store.list(selector).try_collect()).await?;
    let mut orphans: Vec<Orphan> = live
        .into_iter()
        .filter(|o| selector.matches(o.labels()) && !set.contains(&o.identity))
        .map(|o| Orphan { identity: o.identity, resource_version: o.resource_version })
        .collect();
    orphans.sort();
    orphans.dedup_by(|a, b| a.identity == b.identity);
    Ok(orphans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as Json};
    use skiff_core::{DeltaAction, PROJECT_LABEL, TARGET_LABEL};
    use skiff_kubehub::{ApplyOptions, ClusterContext, MemoryStore, Op};
    use std::collections::BTreeMap;

    fn target() -> Target {
        Target {
            project: "simple".into(),
            name: "test".into(),
            context: ClusterContext::new(None),
            namespace: "simple".into(),
            args: BTreeMap::new(),
        }
    }

    fn owned_cm(name: &str, data: Json) -> Json {
        json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "simple", "labels": {PROJECT_LABEL: "simple", TARGET_LABEL: "test"}},
            "data": data,
        })
    }

    fn doc(v: Json) -> Document { Document::from_json(v).unwrap() }

    fn fast_opts() -> DiffOptions {
        DiffOptions {
            retry: RetryPolicy { initial_delay: std::time::Duration::from_millis(1), ..RetryPolicy::default() },
            ..DiffOptions::default()
        }
    }

    #[tokio::test]
    async fn absent_resources_are_created_present_ones_compared() {
        let store = MemoryStore::new();
        let cm = doc(owned_cm("cm", json!({"a": "1"})));
        store.apply(&cm.identity(), &cm, None, &ApplyOptions::default()).await.unwrap();

        let set = ManifestSet::from_documents([cm.clone(), doc(owned_cm("cm2", json!({})))]).unwrap();
        let out = compute_deltas(&set, &target(), &store, &fast_opts()).await.unwrap();
        let actions: Vec<DeltaAction> = out.deltas().map(|d| d.action()).collect();
        assert_eq!(actions, vec![DeltaAction::Noop, DeltaAction::Create]);
        assert_eq!(out.planned[0].observed_rv.as_deref(), Some("1"));
        assert_eq!(out.planned[1].observed_rv, None);
        assert!(out.orphans.is_empty());
        assert_eq!(store.mutations(), 1);
    }

    #[tokio::test]
    async fn changed_field_yields_update_with_patch() {
        let store = MemoryStore::new();
        let cm = doc(owned_cm("cm", json!({"a": "1"})));
        store.apply(&cm.identity(), &cm, None, &ApplyOptions::default()).await.unwrap();

        let set = ManifestSet::from_documents([doc(owned_cm("cm", json!({"a": "2"})))]).unwrap();
        let out = compute_deltas(&set, &target(), &store, &fast_opts()).await.unwrap();
        match &out.planned[0].delta.change {
            Change::Update(p) => assert_eq!(p.changes[0].path.to_string(), ".data.a"),
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn deletion_marker_deletes_only_when_live() {
        let store = MemoryStore::new();
        let mut body = owned_cm("cm", json!({}));
        body["metadata"]["annotations"] = json!({"skiff.dev/delete": "true"});
        let set = ManifestSet::from_documents([doc(body.clone())]).unwrap();

        let out = compute_deltas(&set, &target(), &store, &fast_opts()).await.unwrap();
        assert_eq!(out.planned[0].delta.action(), DeltaAction::Noop);

        store.insert(owned_cm("cm", json!({}))).unwrap();
        let out = compute_deltas(&set, &target(), &store, &fast_opts()).await.unwrap();
        assert_eq!(out.planned[0].delta.action(), DeltaAction::Delete);
    }

    #[tokio::test]
    async fn orphans_require_both_ownership_labels() {
        let store = MemoryStore::new();
        store.insert(owned_cm("old", json!({}))).unwrap();
        store.insert(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "foreign", "namespace": "simple"}})).unwrap();
        store
            .insert(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "other-target", "namespace": "simple", "labels": {PROJECT_LABEL: "simple", TARGET_LABEL: "prod"}}}))
            .unwrap();

        let set = ManifestSet::from_documents([doc(owned_cm("cm", json!({})))]).unwrap();
        let out = compute_deltas(&set, &target(), &store, &fast_opts()).await.unwrap();
        let ids: Vec<&ObjectRef> = out.orphans.iter().map(|o| &o.identity).collect();
        assert_eq!(ids, vec![&ObjectRef::new("", "ConfigMap", Some("simple"), "old")]);
        assert_eq!(out.orphans[0].resource_version, store.get_body(ids[0]).unwrap()["metadata"]["resourceVersion"]);
    }

    #[tokio::test]
    async fn read_errors_are_isolated_per_resource() {
        let store = MemoryStore::new();
        let bad = doc(owned_cm("bad", json!({})));
        store.inject(Op::Get, Some(bad.identity()), StoreError::Rejected("no such kind".into()), 1);
        let set = ManifestSet::from_documents([doc(owned_cm("a", json!({}))), bad.clone(), doc(owned_cm("z", json!({})))]).unwrap();

        let out = compute_deltas(&set, &target(), &store, &fast_opts()).await.unwrap();
        assert_eq!(out.planned.len(), 2);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].0, bad.identity());
    }

    #[tokio::test]
    async fn transient_reads_are_retried() {
        let store = MemoryStore::new();
        let cm = doc(owned_cm("cm", json!({})));
        store.inject(Op::Get, Some(cm.identity()), StoreError::Transient("timeout".into()), 2);
        let set = ManifestSet::from_documents([cm]).unwrap();

        let out = compute_deltas(&set, &target(), &store, &fast_opts()).await.unwrap();
        assert!(out.errors.is_empty());
        assert_eq!(out.planned[0].delta.action(), DeltaAction::Create);
        assert_eq!(store.calls(Op::Get), 3);
    }

    #[tokio::test]
    async fn fatal_read_aborts_the_pass() {
        let store = MemoryStore::new();
        store.inject(Op::Get, None, StoreError::Fatal("forbidden".into()), 1);
        let set = ManifestSet::from_documents([doc(owned_cm("cm", json!({})))]).unwrap();
        let err = compute_deltas(&set, &target(), &store, &fast_opts()).await.unwrap_err();
        assert!(err.is_fatal());
    }

    /// Reads of `stuck` never return.
    struct Stuck {
        inner: MemoryStore,
        stuck: ObjectRef,
    }

    #[async_trait::async_trait]
    impl ObjectStore for Stuck {
        async fn scope(&self, group: &str, kind: &str) -> Result<skiff_core::Scope, StoreError> { self.inner.scope(group, kind).await }

        async fn get(&self, id: &ObjectRef) -> Result<LiveObject, StoreError> {
            if id == &self.stuck {
                futures::future::pending::<()>().await;
            }
            self.inner.get(id).await
        }

        fn list<'a>(&'a self, selector: &'a LabelSelector) -> futures::stream::BoxStream<'a, Result<LiveObject, StoreError>> { self.inner.list(selector) }

        async fn apply(&self, id: &ObjectRef, doc: &Document, rv: Option<&str>, opts: &ApplyOptions) -> Result<LiveObject, StoreError> {
            self.inner.apply(id, doc, rv, opts).await
        }

        async fn delete(&self, id: &ObjectRef, rv: Option<&str>) -> Result<(), StoreError> { self.inner.delete(id, rv).await }
    }

    #[tokio::test]
    async fn fatal_read_does_not_wait_for_other_reads() {
        let inner = MemoryStore::new();
        let bad = doc(owned_cm("bad", json!({})));
        inner.inject(Op::Get, Some(bad.identity()), StoreError::Fatal("forbidden".into()), 1);
        let slow = doc(owned_cm("slow", json!({})));
        let store = Stuck { inner, stuck: slow.identity() };
        let set = ManifestSet::from_documents([slow, bad]).unwrap();

        let res = tokio::time::timeout(std::time::Duration::from_secs(5), compute_deltas(&set, &target(), &store, &fast_opts())).await;
        let err = res.expect("pass should stop at the fatal read").unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn list_failure_becomes_a_warning() {
        let store = MemoryStore::new();
        store.inject(Op::List, None, StoreError::Rejected("list not allowed".into()), 1);
        let set = ManifestSet::from_documents([doc(owned_cm("cm", json!({})))]).unwrap();
        let out = compute_deltas(&set, &target(), &store, &fast_opts()).await.unwrap();
        assert_eq!(out.warnings.len(), 1);
        assert!(out.orphans.is_empty());
    }

    #[tokio::test]
    async fn output_follows_manifest_order_under_concurrency() {
        let store = MemoryStore::new();
        let docs: Vec<Document> = (0..40).map(|i| doc(owned_cm(&format!("cm-{:02}", 39 - i), json!({})))).collect();
        let expected: Vec<ObjectRef> = docs.iter().map(|d| d.identity()).collect();
        let set = ManifestSet::from_documents(docs).unwrap();
        let opts = DiffOptions { workers: 8, ..fast_opts() };
        let out = compute_deltas(&set, &target(), &store, &opts).await.unwrap();
        let got: Vec<ObjectRef> = out.deltas().map(|d| d.identity.clone()).collect();
        assert_eq!(got, expected);
    }
}
