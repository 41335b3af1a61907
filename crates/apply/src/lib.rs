//! Skiff apply: the reconciler driving resolve, diff, apply and prune.
//!
//! A deploy is one pass through
//! `Resolving -> Materializing -> Diffing -> Applying -> Pruning -> Done`.
//! Dry-run shares the exact same path up to and including Diffing and stops
//! there. Per-resource failures are recorded in the [`DeployResult`]; only
//! configuration errors and fatal store errors abort without a result.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::{FutureExt, Stream, StreamExt};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use skiff_core::{
    now_ms, Change, DeltaAction, DeployResult, Document, LabelSelector, ManifestError, ManifestSet, ObjectRef, OrphanOutcome,
    OrphanStatus, OutcomeStatus, ResourceOutcome,
};
use skiff_diff::{compute_deltas, diff_one, DiffOptions, MergePolicy, Orphan, PlannedDelta, DEFAULT_WORKERS};
use skiff_kubehub::{retry_transient, ApplyMode, ApplyOptions, Connector, ObjectStore, RetryPolicy, StoreError};
use skiff_target::{Overrides, TargetError, TargetResolver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod render;

pub use render::{load_manifests, materialize, parse_documents};

/// Re-diffs allowed after an apply precondition fails.
pub const CONFLICT_RETRIES: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    /// Authentication, authorization or client setup failure.
    #[error("deploy aborted: {0}")]
    Fatal(StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Resolving,
    Materializing,
    Diffing,
    Applying,
    Pruning,
    Done,
}

pub(crate) fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub dry_run: bool,
    /// Delete orphans instead of only reporting them.
    pub prune: bool,
    pub merge_policy: MergePolicy,
    pub apply_mode: ApplyMode,
    pub force_conflicts: bool,
    /// Stop scheduling later waves after the first per-resource error.
    pub abort_on_error: bool,
    /// When the server refuses an update, retry it as a full replace carrying
    /// the observed resource version.
    pub replace_on_error: bool,
    /// Like `replace_on_error`, and if the replace is refused too, delete the
    /// object and create it again.
    pub force_replace_on_error: bool,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            prune: false,
            merge_policy: MergePolicy::default(),
            apply_mode: ApplyMode::default(),
            force_conflicts: false,
            abort_on_error: false,
            replace_on_error: false,
            force_replace_on_error: false,
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }
}

impl DeployOptions {
    /// Defaults with `SKIFF_WORKERS` and `SKIFF_RETRY_ATTEMPTS` applied.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_or("SKIFF_WORKERS", d.workers).max(1),
            retry: RetryPolicy::with_max_attempts(env_or("SKIFF_RETRY_ATTEMPTS", d.retry.max_attempts)),
            ..d
        }
    }

    fn diff_options(&self) -> DiffOptions {
        DiffOptions { policy: self.merge_policy, workers: self.workers.max(1), retry: self.retry.clone() }
    }

    fn apply_options(&self) -> ApplyOptions {
        ApplyOptions { mode: self.apply_mode, force_conflicts: self.force_conflicts }
    }
}

/// Runs deploys for the targets of one project.
pub struct Reconciler {
    resolver: TargetResolver,
    connector: Arc<dyn Connector>,
}

impl Reconciler {
    pub fn new(resolver: TargetResolver, connector: Arc<dyn Connector>) -> Self {
        Self { resolver, connector }
    }

    pub fn resolver(&self) -> &TargetResolver { &self.resolver }

    /// Deploy `documents` to `target_name`.
    pub async fn deploy(&self, target_name: &str, overrides: &Overrides, documents: Vec<Document>, opts: &DeployOptions) -> Result<DeployResult, DeployError> {
        let t0 = Instant::now();
        let run = Uuid::new_v4();
        counter!("deploy_attempts", 1u64);

        let res = self.run(run, target_name, overrides, documents, opts).await;
        histogram!("deploy_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(r) => {
                let s = r.summary();
                info!(
                    %run, target = %target_name, dry_run = opts.dry_run,
                    creates = s.creates, updates = s.updates, deletes = s.deletes, unchanged = s.unchanged,
                    errors = s.errors, orphans = s.orphans, pruned = s.pruned, cancelled = r.cancelled,
                    took_ms = %t0.elapsed().as_millis(), "deploy finished"
                );
                counter!("deploy_ok", 1u64);
            }
            Err(e) => {
                warn!(%run, target = %target_name, error = %e, "deploy failed");
                counter!("deploy_err", 1u64);
            }
        }
        res
    }

    async fn run(&self, run: Uuid, target_name: &str, overrides: &Overrides, documents: Vec<Document>, opts: &DeployOptions) -> Result<DeployResult, DeployError> {
        phase(run, Phase::Resolving);
        let target = self.resolver.resolve(target_name, overrides)?;
        let store = self.connector.connect(&target.context);
        let store = store.as_ref();
        let mut result = DeployResult::new(&target.project, &target.name, opts.dry_run, opts.prune);

        phase(run, Phase::Materializing);
        let set = match or_cancel(&opts.cancel, materialize(documents, &target, store)).await {
            Some(set) => set?,
            None => {
                result.cancelled = true;
                return Ok(finish(result));
            }
        };

        phase(run, Phase::Diffing);
        let diff = match or_cancel(&opts.cancel, compute_deltas(&set, &target, store, &opts.diff_options())).await {
            Some(d) => d.map_err(DeployError::Fatal)?,
            None => {
                result.cancelled = true;
                result.resources = set.iter().map(|d| abandoned(d.identity(), None)).collect();
                return Ok(finish(result));
            }
        };
        result.warnings.extend(diff.warnings.iter().cloned());

        let mut outcomes: FxHashMap<ObjectRef, ResourceOutcome> = FxHashMap::default();
        for (id, e) in &diff.errors {
            outcomes.insert(id.clone(), failed(id.clone(), None, e));
        }
        let mut pending: BTreeMap<i32, Vec<PlannedDelta>> = BTreeMap::new();
        for p in diff.planned {
            let id = p.delta.identity.clone();
            if p.delta.change.is_noop() {
                outcomes.insert(id.clone(), outcome(id, &p, OutcomeStatus::Unchanged));
            } else if opts.dry_run {
                outcomes.insert(id.clone(), outcome(id, &p, OutcomeStatus::Skipped));
            } else {
                pending.entry(p.wave).or_default().push(p);
            }
        }

        if !opts.dry_run {
            phase(run, Phase::Applying);
            let mut stop = opts.abort_on_error && !diff.errors.is_empty();
            for (wave, planned) in pending {
                if stop || result.cancelled {
                    for p in planned {
                        let id = p.delta.identity.clone();
                        outcomes.insert(id.clone(), abandoned(id, Some(&p)));
                    }
                    continue;
                }
                debug!(%run, wave, resources = planned.len(), "applying wave");
                let (done, cancelled) = self.apply_wave(&planned, &set, store, opts).await.map_err(DeployError::Fatal)?;
                for o in done {
                    outcomes.insert(o.identity.clone(), o);
                }
                for p in &planned {
                    if !outcomes.contains_key(&p.delta.identity) {
                        outcomes.insert(p.delta.identity.clone(), abandoned(p.delta.identity.clone(), Some(p)));
                    }
                }
                result.cancelled |= cancelled;
                if opts.abort_on_error && planned.iter().any(|p| outcomes.get(&p.delta.identity).map(|o| o.status == OutcomeStatus::Failed).unwrap_or(false)) {
                    stop = true;
                }
            }
            result.aborted = stop;
        }

        if opts.prune && !opts.dry_run && !result.aborted && !result.cancelled {
            phase(run, Phase::Pruning);
            let owned = LabelSelector::ownership(&target.project, &target.name);
            let (orphans, cancelled) = self.prune(&diff.orphans, &owned, store, opts).await.map_err(DeployError::Fatal)?;
            result.orphans = orphans;
            result.cancelled |= cancelled;
        } else {
            let status = if opts.prune && !opts.dry_run { OrphanStatus::Abandoned } else { OrphanStatus::Reported };
            result.orphans = diff.orphans.iter().map(|o| OrphanOutcome { identity: o.identity.clone(), status, error: None }).collect();
        }

        phase(run, Phase::Done);
        result.resources = set.iter().filter_map(|d| outcomes.remove(&d.identity())).collect();
        Ok(finish(result))
    }

    /// Apply one wave concurrently. Returns the finished outcomes and whether
    /// the deploy was cancelled before all of them completed. Nothing new is
    /// started once the token fires.
    async fn apply_wave(&self, planned: &[PlannedDelta], set: &ManifestSet, store: &dyn ObjectStore, opts: &DeployOptions) -> Result<(Vec<ResourceOutcome>, bool), StoreError> {
        let work = futures::stream::iter(planned.iter().filter_map(|p| set.get(&p.delta.identity).map(|doc| (p, doc))))
            .take_until(opts.cancel.cancelled())
            .map(|(p, doc)| self.apply_one(p.clone(), doc, store, opts))
            .buffer_unordered(opts.workers.max(1));
        drain(work, &opts.cancel).await
    }

    /// Compare-and-swap apply of a single delta with a bounded re-diff on conflict.
    async fn apply_one(&self, planned: PlannedDelta, doc: &Document, store: &dyn ObjectStore, opts: &DeployOptions) -> Result<ResourceOutcome, StoreError> {
        let id = planned.delta.identity.clone();
        let apply_opts = opts.apply_options();
        let mut planned = planned;
        let mut attempt = 0u32;
        loop {
            let err = match write(&planned, doc, store, &apply_opts, &opts.retry).await {
                Ok(()) => {
                    counter!("apply_ok", 1u64);
                    debug!(%id, action = %planned.delta.action(), "applied");
                    return Ok(outcome(id, &planned, OutcomeStatus::Applied));
                }
                Err(e) => e,
            };
            if err.is_fatal() {
                return Err(err);
            }
            if matches!(err, StoreError::Rejected(_))
                && planned.delta.action() == DeltaAction::Update
                && (opts.replace_on_error || opts.force_replace_on_error)
            {
                return replace_fallback(&planned, doc, store, opts, err).await;
            }
            if !err.is_conflict() || attempt >= CONFLICT_RETRIES {
                counter!("apply_err", 1u64);
                warn!(%id, error = %err, "apply failed");
                return Ok(failed(id, Some(&planned), &err));
            }
            attempt += 1;
            counter!("apply_conflict_retry", 1u64);
            info!(%id, observed_rv = ?planned.observed_rv, "conflict, re-diffing");
            planned = match diff_one(doc, store, &opts.diff_options()).await {
                Ok(p) if p.delta.change.is_noop() => return Ok(outcome(id, &p, OutcomeStatus::Unchanged)),
                Ok(p) => p,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => return Ok(failed(id, Some(&planned), &e)),
            };
        }
    }

    async fn prune(&self, orphans: &[Orphan], owned: &LabelSelector, store: &dyn ObjectStore, opts: &DeployOptions) -> Result<(Vec<OrphanOutcome>, bool), StoreError> {
        let work = futures::stream::iter(orphans)
            .take_until(opts.cancel.cancelled())
            .map(|orphan| prune_one(orphan, owned, store, opts))
            .buffer_unordered(opts.workers.max(1));
        let (mut done, cancelled) = drain(work, &opts.cancel).await?;
        for o in orphans {
            if !done.iter().any(|d| d.identity == o.identity) {
                done.push(orphan_outcome(&o.identity, OrphanStatus::Abandoned, None));
            }
        }
        done.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok((done, cancelled))
    }
}

/// Delete one orphan under the resource version it was listed with. On a
/// conflict the object is read again and deleted only if it still carries
/// the ownership labels.
async fn prune_one(orphan: &Orphan, owned: &LabelSelector, store: &dyn ObjectStore, opts: &DeployOptions) -> Result<OrphanOutcome, StoreError> {
    let id = &orphan.identity;
    let mut rv = orphan.resource_version.clone();
    let mut attempt = 0u32;
    loop {
        let expected = rv.as_str();
        let err = match retry_transient(&opts.retry, "delete", || store.delete(id, Some(expected))).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {
                counter!("prune_deleted", 1u64);
                info!(%id, "pruned");
                return Ok(orphan_outcome(id, OrphanStatus::Deleted, None));
            }
            Err(e) => e,
        };
        if err.is_fatal() {
            return Err(err);
        }
        if !err.is_conflict() || attempt >= CONFLICT_RETRIES {
            counter!("prune_err", 1u64);
            warn!(%id, error = %err, "prune failed");
            return Ok(orphan_outcome(id, OrphanStatus::Failed, Some(err.to_string())));
        }
        attempt += 1;
        counter!("prune_conflict_retry", 1u64);
        info!(%id, listed_rv = %rv, "orphan changed since listing, re-reading");
        match retry_transient(&opts.retry, "get", || store.get_opt(id)).await {
            Ok(None) => return Ok(orphan_outcome(id, OrphanStatus::Deleted, None)),
            Ok(Some(live)) if owned.matches(live.labels()) => rv = live.resource_version,
            Ok(Some(_)) => {
                info!(%id, "ownership labels gone, leaving object in place");
                return Ok(orphan_outcome(id, OrphanStatus::Released, None));
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => return Ok(orphan_outcome(id, OrphanStatus::Failed, Some(e.to_string()))),
        }
    }
}

/// Fallbacks for an update the server refused: a full replace under the
/// observed resource version, then, if allowed, delete and create again.
async fn replace_fallback(planned: &PlannedDelta, doc: &Document, store: &dyn ObjectStore, opts: &DeployOptions, cause: StoreError) -> Result<ResourceOutcome, StoreError> {
    let id = &planned.delta.identity;
    let rv = planned.observed_rv.as_deref();
    warn!(%id, error = %cause, "apply refused, retrying with replace");
    let replace = ApplyOptions { mode: ApplyMode::Replace, ..opts.apply_options() };
    let err = match retry_transient(&opts.retry, "replace", || store.apply(id, doc, rv, &replace)).await {
        Ok(_) => {
            counter!("apply_replaced", 1u64);
            return Ok(outcome(id.clone(), planned, OutcomeStatus::Applied));
        }
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => e,
    };
    if !opts.force_replace_on_error {
        counter!("apply_err", 1u64);
        warn!(%id, error = %err, "replace failed");
        return Ok(failed(id.clone(), Some(planned), &err));
    }

    warn!(%id, error = %err, "replace refused, deleting and re-creating");
    match retry_transient(&opts.retry, "delete", || store.delete(id, rv)).await {
        Ok(()) | Err(StoreError::NotFound(_)) => {}
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            counter!("apply_err", 1u64);
            return Ok(failed(id.clone(), Some(planned), &e));
        }
    }
    let apply_opts = opts.apply_options();
    match retry_transient(&opts.retry, "apply", || store.apply(id, doc, None, &apply_opts)).await {
        Ok(_) => {
            counter!("apply_recreated", 1u64);
            Ok(outcome(id.clone(), planned, OutcomeStatus::Applied))
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            counter!("apply_err", 1u64);
            warn!(%id, error = %e, "re-create failed");
            Ok(failed(id.clone(), Some(planned), &e))
        }
    }
}

/// Send one delta to the store, retrying transient failures.
async fn write(planned: &PlannedDelta, doc: &Document, store: &dyn ObjectStore, opts: &ApplyOptions, retry: &RetryPolicy) -> Result<(), StoreError> {
    let id = &planned.delta.identity;
    let rv = planned.observed_rv.as_deref();
    match &planned.delta.change {
        Change::Create | Change::Update(_) => retry_transient(retry, "apply", || store.apply(id, doc, rv, opts)).await.map(|_| ()),
        Change::Delete => match retry_transient(retry, "delete", || store.delete(id, rv)).await {
            Err(StoreError::NotFound(_)) => Ok(()),
            other => other,
        },
        Change::Noop => Ok(()),
    }
}

/// Collect results until the stream ends, the token fires, or a fatal error.
///
/// On cancellation, results that are already complete are still collected;
/// work still in flight is dropped.
async fn drain<T>(stream: impl Stream<Item = Result<T, StoreError>>, cancel: &CancellationToken) -> Result<(Vec<T>, bool), StoreError> {
    futures::pin_mut!(stream);
    let mut out = Vec::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                while let Some(Some(item)) = stream.next().now_or_never() {
                    out.push(item?);
                }
                return Ok((out, true));
            }
            next = stream.next() => match next {
                Some(item) => out.push(item?),
                None => return Ok((out, false)),
            },
        }
    }
}

async fn or_cancel<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

fn phase(run: Uuid, phase: Phase) {
    debug!(%run, ?phase, "phase");
}

fn finish(mut result: DeployResult) -> DeployResult {
    result.finished_ms = now_ms();
    result
}

fn outcome(identity: ObjectRef, p: &PlannedDelta, status: OutcomeStatus) -> ResourceOutcome {
    let patch = match &p.delta.change {
        Change::Update(patch) => Some(patch.clone()),
        _ => None,
    };
    ResourceOutcome { identity, action: Some(p.delta.action()), status, patch, error: None }
}

fn failed(identity: ObjectRef, p: Option<&PlannedDelta>, err: &StoreError) -> ResourceOutcome {
    ResourceOutcome {
        identity,
        action: p.map(|p| p.delta.action()),
        status: OutcomeStatus::Failed,
        patch: None,
        error: Some(err.to_string()),
    }
}

fn orphan_outcome(identity: &ObjectRef, status: OrphanStatus, error: Option<String>) -> OrphanOutcome {
    OrphanOutcome { identity: identity.clone(), status, error }
}

fn abandoned(identity: ObjectRef, p: Option<&PlannedDelta>) -> ResourceOutcome {
    ResourceOutcome { identity, action: p.map(|p| p.delta.action()), status: OutcomeStatus::Abandoned, patch: None, error: None }
}
