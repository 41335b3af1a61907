//! Deploy result: the single externally observable output of a deploy.

use serde::{Deserialize, Serialize};

use crate::{DeltaAction, FieldPatch, ObjectRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// Written to the cluster.
    Applied,
    /// Planned but not sent (dry-run).
    Skipped,
    /// Noop delta, nothing to do.
    Unchanged,
    Failed,
    /// Never finished: cancelled or aborted after an earlier error.
    Abandoned,
}

/// Outcome for one identity of the manifest set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceOutcome {
    pub identity: ObjectRef,
    /// `None` when the live object could not be read, so no delta exists.
    pub action: Option<DeltaAction>,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<FieldPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanStatus {
    /// Reported only (pruning disabled or dry-run).
    Reported,
    Deleted,
    Failed,
    Abandoned,
    /// Lost its ownership labels between listing and deletion; left in place.
    Released,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanOutcome {
    pub identity: ObjectRef,
    pub status: OrphanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub unchanged: usize,
    pub errors: usize,
    pub orphans: usize,
    pub pruned: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployResult {
    pub project: String,
    pub target: String,
    pub dry_run: bool,
    pub prune: bool,
    pub started_ms: i64,
    pub finished_ms: i64,
    pub resources: Vec<ResourceOutcome>,
    pub orphans: Vec<OrphanOutcome>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Set when the deploy was cancelled before all work finished.
    #[serde(default)]
    pub cancelled: bool,
    /// Set when abort-on-error stopped scheduling further work.
    #[serde(default)]
    pub aborted: bool,
}

impl DeployResult {
    pub fn new(project: &str, target: &str, dry_run: bool, prune: bool) -> Self {
        Self {
            project: project.to_string(),
            target: target.to_string(),
            dry_run,
            prune,
            started_ms: crate::now_ms(),
            finished_ms: 0,
            resources: Vec::new(),
            orphans: Vec::new(),
            warnings: Vec::new(),
            cancelled: false,
            aborted: false,
        }
    }

    pub fn outcome(&self, id: &ObjectRef) -> Option<&ResourceOutcome> {
        self.resources.iter().find(|r| &r.identity == id)
    }

    /// Non-noop deltas reported by this run, in manifest order.
    pub fn changes(&self) -> impl Iterator<Item = (&ObjectRef, DeltaAction)> {
        self.resources.iter().filter_map(|r| match r.action {
            Some(a) if a != DeltaAction::Noop => Some((&r.identity, a)),
            _ => None,
        })
    }

    pub fn errors(&self) -> impl Iterator<Item = (&ObjectRef, &str)> {
        let res = self.resources.iter().filter_map(|r| r.error.as_deref().map(|e| (&r.identity, e)));
        let orph = self.orphans.iter().filter_map(|o| o.error.as_deref().map(|e| (&o.identity, e)));
        res.chain(orph)
    }

    pub fn has_errors(&self) -> bool { self.errors().next().is_some() }

    /// Exit semantics for the CLI: per-resource errors only fail strict runs.
    pub fn is_success(&self, strict: bool) -> bool {
        !self.cancelled && !(strict && self.has_errors())
    }

    pub fn summary(&self) -> Summary {
        let mut s = Summary::default();
        for r in &self.resources {
            match r.action {
                Some(DeltaAction::Create) => s.creates += 1,
                Some(DeltaAction::Update) => s.updates += 1,
                Some(DeltaAction::Delete) => s.deletes += 1,
                Some(DeltaAction::Noop) => s.unchanged += 1,
                None => {}
            }
        }
        s.errors = self.errors().count();
        s.orphans = self.orphans.len();
        s.pruned = self.orphans.iter().filter(|o| o.status == OrphanStatus::Deleted).count();
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(name: &str, action: Option<DeltaAction>, status: OutcomeStatus, error: Option<&str>) -> ResourceOutcome {
        ResourceOutcome {
            identity: ObjectRef::new("", "ConfigMap", Some("ns"), name),
            action,
            status,
            patch: None,
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn summary_and_exit_semantics() {
        let mut r = DeployResult::new("p", "test", false, false);
        r.resources.push(outcome("a", Some(DeltaAction::Create), OutcomeStatus::Applied, None));
        r.resources.push(outcome("b", Some(DeltaAction::Noop), OutcomeStatus::Unchanged, None));
        r.resources.push(outcome("c", None, OutcomeStatus::Failed, Some("transient: timeout")));
        r.orphans.push(OrphanOutcome { identity: ObjectRef::new("", "ConfigMap", Some("ns"), "old"), status: OrphanStatus::Reported, error: None });

        let s = r.summary();
        assert_eq!((s.creates, s.unchanged, s.errors, s.orphans, s.pruned), (1, 1, 1, 1, 0));
        assert_eq!(r.changes().count(), 1);
        assert!(r.is_success(false));
        assert!(!r.is_success(true));
    }

    #[test]
    fn result_round_trips_through_json() {
        let mut r = DeployResult::new("p", "test", true, false);
        r.resources.push(outcome("a", Some(DeltaAction::Create), OutcomeStatus::Skipped, None));
        let text = serde_json::to_string(&r).unwrap();
        assert!(text.contains("\"status\":\"skipped\""));
        let back: DeployResult = serde_json::from_str(&text).unwrap();
        assert_eq!(back, r);
    }
}
