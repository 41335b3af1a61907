//! Human-readable rendering of deploy results.

use serde_json::Value as Json;
use skiff_core::{DeployResult, FieldChange, OrphanStatus, OutcomeStatus, PatchOp};
use skiff_persist::ResultRecord;

pub fn print_result(r: &DeployResult, show_patches: bool) {
    let mode = if r.dry_run { " (dry-run)" } else { "" };
    println!("{}/{}{}", r.project, r.target, mode);
    for o in &r.resources {
        let action = o.action.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string());
        println!("  {:<7} {:<10} {}", action, status_str(o.status), o.identity);
        if let Some(err) = &o.error {
            println!("      error: {}", err);
        }
        if show_patches {
            for c in o.patch.iter().flat_map(|p| &p.changes) {
                println!("      {}", render_change(c));
            }
        }
    }
    for o in &r.orphans {
        let status = match o.status {
            OrphanStatus::Reported => "orphan",
            OrphanStatus::Deleted => "pruned",
            OrphanStatus::Failed => "failed",
            OrphanStatus::Abandoned => "abandoned",
            OrphanStatus::Released => "released",
        };
        println!("  {:<7} {:<10} {}", "orphan", status, o.identity);
        if let Some(err) = &o.error {
            println!("      error: {}", err);
        }
    }
    for w in &r.warnings {
        println!("  warning: {}", w);
    }
    let s = r.summary();
    println!(
        "{} create, {} update, {} delete, {} unchanged, {} orphan(s), {} pruned, {} error(s){}{}",
        s.creates,
        s.updates,
        s.deletes,
        s.unchanged,
        s.orphans,
        s.pruned,
        s.errors,
        if r.aborted { ", aborted" } else { "" },
        if r.cancelled { ", cancelled" } else { "" },
    );
}

pub fn print_history_row(row: &ResultRecord) {
    let when = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(row.ts).map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_else(|| row.ts.to_string());
    let s = row.result.summary();
    println!(
        "{}  {}  create={} update={} delete={} pruned={} errors={}{}",
        when,
        if row.dry_run { "dry-run" } else { "deploy " },
        s.creates,
        s.updates,
        s.deletes,
        s.pruned,
        s.errors,
        if row.result.cancelled { " (cancelled)" } else { "" },
    );
}

fn status_str(s: OutcomeStatus) -> &'static str {
    match s {
        OutcomeStatus::Applied => "applied",
        OutcomeStatus::Skipped => "planned",
        OutcomeStatus::Unchanged => "unchanged",
        OutcomeStatus::Failed => "failed",
        OutcomeStatus::Abandoned => "abandoned",
    }
}

fn render_change(c: &FieldChange) -> String {
    match c.op {
        PatchOp::Add => format!("+ {}: {}", c.path, short(c.desired.as_ref())),
        PatchOp::Remove => format!("- {}: {}", c.path, short(c.live.as_ref())),
        PatchOp::Change => format!("~ {}: {} -> {}", c.path, short(c.live.as_ref()), short(c.desired.as_ref())),
    }
}

/// Compact one-line JSON, truncated for the terminal.
fn short(v: Option<&Json>) -> String {
    let s = v.map(|v| v.to_string()).unwrap_or_else(|| "null".to_string());
    if s.chars().count() > 80 {
        let cut: String = s.chars().take(77).collect();
        format!("{}...", cut)
    } else {
        s
    }
}
