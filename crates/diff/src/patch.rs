//! Field-level comparison of a desired document against a live object.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use skiff_core::{FieldChange, FieldPatch, FieldPath, PatchOp};

/// Which live fields a patch is computed over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// Only fields declared in the desired document are compared; fields
    /// written by other actors are left alone.
    #[default]
    FieldOwnership,
    /// Live fields missing from the desired document are reported as removals.
    Replace,
}

/// Metadata fields populated by the API server.
const SERVER_METADATA: &[&str] = &["uid", "resourceVersion", "generation", "creationTimestamp", "managedFields", "selfLink"];

/// Drop server-populated fields and the top-level `apiVersion`, which the
/// server reports at its preferred version.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for key in SERVER_METADATA {
            meta.remove(*key);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
        obj.remove("apiVersion");
    }
    v
}

/// Compute the changes needed to make `live` match `desired`.
pub fn compute_field_patch(desired: &Json, live: &Json, policy: MergePolicy) -> FieldPatch {
    let desired = strip_noisy(desired.clone());
    let live = strip_noisy(live.clone());
    let mut changes = Vec::new();
    walk(&FieldPath::root(), &desired, &live, policy, &mut changes);
    FieldPatch { changes }
}

fn walk(path: &FieldPath, desired: &Json, live: &Json, policy: MergePolicy, out: &mut Vec<FieldChange>) {
    match (desired, live) {
        (Json::Object(d), Json::Object(l)) => {
            for (k, dv) in d {
                let p = path.key(k);
                match (dv, l.get(k)) {
                    (Json::Null, None) => {}
                    (Json::Null, Some(lv)) => out.push(removal(p, lv)),
                    (dv, None) => out.push(FieldChange { path: p, op: PatchOp::Add, desired: Some(dv.clone()), live: None }),
                    (dv, Some(lv)) => walk(&p, dv, lv, policy, out),
                }
            }
            if policy == MergePolicy::Replace {
                for (k, lv) in l {
                    if !d.contains_key(k) {
                        out.push(removal(path.key(k), lv));
                    }
                }
            }
        }
        // Same length: positional comparison, so list entries may carry
        // server defaults. Otherwise the whole list is replaced.
        (Json::Array(d), Json::Array(l)) if d.len() == l.len() => {
            for (i, (dv, lv)) in d.iter().zip(l).enumerate() {
                walk(&path.index(i), dv, lv, policy, out);
            }
        }
        (d, l) if scalars_equal(d, l) => {}
        (d, l) => out.push(FieldChange { path: path.clone(), op: PatchOp::Change, desired: Some(d.clone()), live: Some(l.clone()) }),
    }
}

fn removal(path: FieldPath, live: &Json) -> FieldChange {
    FieldChange { path, op: PatchOp::Remove, desired: None, live: Some(live.clone()) }
}

/// Numbers compare by value, so `1` equals `1.0`.
fn scalars_equal(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}
