//! Deltas: the planned change for one desired resource, plus field-level patches.

use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as Json;
use smallvec::SmallVec;

use crate::ObjectRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Location of a field inside a document, e.g. `.spec.ports[0].port`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPath(pub SmallVec<[PathSegment; 8]>);

impl FieldPath {
    pub fn root() -> Self { Self::default() }

    pub fn key(&self, k: &str) -> Self {
        let mut next = self.clone();
        next.0.push(PathSegment::Key(k.to_string()));
        next
    }

    pub fn index(&self, i: usize) -> Self {
        let mut next = self.clone();
        next.0.push(PathSegment::Index(i));
        next
    }

    pub fn depth(&self) -> usize { self.0.len() }

    /// True if this path starts with the given keys.
    pub fn starts_with_keys(&self, keys: &[&str]) -> bool {
        keys.len() <= self.0.len()
            && keys.iter().zip(self.0.iter()).all(|(k, seg)| matches!(seg, PathSegment::Key(s) if s == k))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str(".");
        }
        for seg in &self.0 {
            match seg {
                PathSegment::Key(k) if needs_quoting(k) => {
                    let quoted = serde_json::to_string(k).map_err(|_| fmt::Error)?;
                    write!(f, "[{}]", quoted)?
                }
                PathSegment::Key(k) => write!(f, ".{}", k)?,
                PathSegment::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}

/// Keys that would not survive the dotted form, e.g. `skiff.dev/project`.
fn needs_quoting(key: &str) -> bool {
    key.is_empty() || key.contains(['.', '[', ']'])
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        parse_field_path(&raw).map_err(serde::de::Error::custom)
    }
}

/// Inverse of the `Display` form: `.a.b[0]["k.with/dots"]`.
pub fn parse_field_path(raw: &str) -> Result<FieldPath, String> {
    let mut out = FieldPath::root();
    if raw == "." {
        return Ok(out);
    }
    let mut rest = raw;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after.find(['.', '[']).unwrap_or(after.len());
            if end == 0 {
                return Err(format!("empty key in field path {:?}", raw));
            }
            out.0.push(PathSegment::Key(after[..end].to_string()));
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix("[\"") {
            let close = closing_quote(after).ok_or_else(|| format!("unterminated key in field path {:?}", raw))?;
            // `rest[1..]` starts at the opening quote
            let literal = &rest[1..close + 3];
            let key: String = serde_json::from_str(literal).map_err(|e| format!("bad key in field path {:?}: {}", raw, e))?;
            let tail = &after[close + 1..];
            rest = tail.strip_prefix(']').ok_or_else(|| format!("missing ']' in field path {:?}", raw))?;
            out.0.push(PathSegment::Key(key));
        } else if let Some(after) = rest.strip_prefix('[') {
            let end = after.find(']').ok_or_else(|| format!("missing ']' in field path {:?}", raw))?;
            let idx = after[..end].parse::<usize>().map_err(|_| format!("bad index in field path {:?}", raw))?;
            out.0.push(PathSegment::Index(idx));
            rest = &after[end + 1..];
        } else {
            return Err(format!("unexpected {:?} in field path {:?}", rest, raw));
        }
    }
    Ok(out)
}

/// Byte offset of the unescaped `"` ending a JSON string body.
fn closing_quote(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Change,
    Remove,
}

/// One differing field between the desired document and the live object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub path: FieldPath,
    pub op: PatchOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live: Option<Json>,
}

/// Field-level patch; empty means the live object already matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldPatch {
    pub changes: Vec<FieldChange>,
}

impl FieldPatch {
    pub fn is_empty(&self) -> bool { self.changes.is_empty() }

    pub fn len(&self) -> usize { self.changes.len() }

    pub fn count(&self, op: PatchOp) -> usize {
        self.changes.iter().filter(|c| c.op == op).count()
    }
}

/// What the reconciler intends to do with one desired resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "patch", rename_all = "lowercase")]
pub enum Change {
    Create,
    Update(FieldPatch),
    Delete,
    Noop,
}

impl Change {
    pub fn action(&self) -> DeltaAction {
        match self {
            Change::Create => DeltaAction::Create,
            Change::Update(_) => DeltaAction::Update,
            Change::Delete => DeltaAction::Delete,
            Change::Noop => DeltaAction::Noop,
        }
    }

    pub fn is_noop(&self) -> bool { matches!(self, Change::Noop) }
}

/// Payload-free tag of a [`Change`], used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaAction {
    Create,
    Update,
    Delete,
    Noop,
}

impl fmt::Display for DeltaAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeltaAction::Create => "create",
            DeltaAction::Update => "update",
            DeltaAction::Delete => "delete",
            DeltaAction::Noop => "noop",
        })
    }
}

/// Planned change for exactly one identity of the manifest set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub identity: ObjectRef,
    #[serde(flatten)]
    pub change: Change,
}

impl Delta {
    pub fn new(identity: ObjectRef, change: Change) -> Self { Self { identity, change } }

    pub fn action(&self) -> DeltaAction { self.change.action() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_path_renders_and_parses() {
        let p = FieldPath::root().key("spec").key("ports").index(0).key("port");
        assert_eq!(p.to_string(), ".spec.ports[0].port");
        assert_eq!(parse_field_path(".spec.ports[0].port").unwrap(), p);
        assert!(p.starts_with_keys(&["spec", "ports"]));
        assert!(!p.starts_with_keys(&["metadata"]));
        assert_eq!(FieldPath::root().to_string(), ".");
    }

    #[test]
    fn dotted_keys_survive_the_string_form() {
        let p = FieldPath::root().key("metadata").key("labels").key("skiff.dev/project");
        assert_eq!(p.to_string(), r#".metadata.labels["skiff.dev/project"]"#);
        let back = parse_field_path(&p.to_string()).unwrap();
        assert_eq!(back, p);
        assert_eq!(back.depth(), 3);

        let odd = FieldPath::root().key("data").key(r#"a"b]"#).index(2).key("");
        assert_eq!(parse_field_path(&odd.to_string()).unwrap(), odd);

        let change = FieldChange { path: p.clone(), op: PatchOp::Add, desired: Some("simple".into()), live: None };
        let text = serde_json::to_string(&change).unwrap();
        let back: FieldChange = serde_json::from_str(&text).unwrap();
        assert_eq!(back.path, p);
    }

    #[test]
    fn malformed_paths_are_rejected() {
        assert!(parse_field_path(".a..b").is_err());
        assert!(parse_field_path(".a[x]").is_err());
        assert!(parse_field_path(r#".a["open"#).is_err());
        assert!(serde_json::from_str::<FieldPath>(r#""a.b""#).is_err());
    }

    #[test]
    fn delta_serializes_with_action_tag() {
        let d = Delta::new(ObjectRef::new("", "ConfigMap", Some("ns"), "cm"), Change::Create);
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["action"], "create");
        assert_eq!(v["identity"]["name"], "cm");

        let patch = FieldPatch {
            changes: vec![FieldChange { path: FieldPath::root().key("data").key("k"), op: PatchOp::Change, desired: Some("b".into()), live: Some("a".into()) }],
        };
        let d = Delta::new(ObjectRef::new("", "ConfigMap", Some("ns"), "cm"), Change::Update(patch));
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["action"], "update");
        assert_eq!(v["patch"]["changes"][0]["path"], ".data.k");
        let back: Delta = serde_json::from_value(v).unwrap();
        assert_eq!(back, d);
    }
}
