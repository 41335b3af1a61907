//! Skiff targets: project configuration and resolution of named deploy targets.
//!
//! A target is resolved from the project file (`.skiff.yml`) plus
//! command-line overrides. Resolution performs no network I/O; the returned
//! [`Target`] carries a lazily connected [`ClusterContext`].

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use skiff_kubehub::ClusterContext;
use tracing::{debug, info};

/// Project file names, in lookup order.
pub const PROJECT_FILES: &[&str] = &[".skiff.yml", ".skiff.yaml"];

/// Namespace used when neither the target nor the document declares one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Override keys every target accepts besides its declared args.
pub const BUILTIN_OVERRIDES: &[&str] = &["context", "namespace"];

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("unknown target {0:?}")]
    UnknownTarget(String),
    #[error("invalid override {key:?} for target {target:?}")]
    InvalidOverride { target: String, key: String },
    #[error("malformed argument {0:?} (expected key=value)")]
    MalformedArg(String),
    #[error("project config: {0}")]
    Config(String),
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
}

/// One declared target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub name: String,
    /// Kubeconfig context; `None` means the current context.
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Recognized override keys and their defaults.
    #[serde(default)]
    pub args: BTreeMap<String, Json>,
}

/// Contents of `.skiff.yml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl ProjectConfig {
    pub fn from_yaml(text: &str) -> Result<Self, TargetError> {
        let cfg: ProjectConfig = serde_yaml::from_str(text).map_err(|e| TargetError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load the project file from `dir`.
    pub fn load(dir: &Path) -> Result<Self, TargetError> {
        for name in PROJECT_FILES {
            let path = dir.join(name);
            if path.is_file() {
                debug!(path = %path.display(), "loading project config");
                let text = std::fs::read_to_string(&path).map_err(|source| TargetError::Io { path: path.clone(), source })?;
                return Self::from_yaml(&text);
            }
        }
        Err(TargetError::Config(format!("no {} found in {}", PROJECT_FILES[0], dir.display())))
    }

    fn validate(&self) -> Result<(), TargetError> {
        let mut seen = std::collections::BTreeSet::new();
        for t in &self.targets {
            if t.name.trim().is_empty() {
                return Err(TargetError::Config("target with empty name".into()));
            }
            if !seen.insert(t.name.as_str()) {
                return Err(TargetError::Config(format!("duplicate target {:?}", t.name)));
            }
            if let Some(k) = t.args.keys().find(|k| BUILTIN_OVERRIDES.contains(&k.as_str())) {
                return Err(TargetError::Config(format!("target {:?}: arg {:?} shadows a builtin override", t.name, k)));
            }
        }
        Ok(())
    }
}

/// A resolved deploy target. Immutable for the rest of the run.
#[derive(Debug, Clone)]
pub struct Target {
    pub project: String,
    pub name: String,
    pub context: ClusterContext,
    pub namespace: String,
    pub args: BTreeMap<String, Json>,
}

/// Override key -> raw value, as given on the command line.
pub type Overrides = BTreeMap<String, String>;

/// Maps target names to [`Target`]s.
#[derive(Debug, Clone)]
pub struct TargetResolver {
    project: String,
    config: ProjectConfig,
}

impl TargetResolver {
    /// `fallback_project` names the project when the config does not.
    pub fn new(config: ProjectConfig, fallback_project: &str) -> Self {
        let project = config.project.clone().unwrap_or_else(|| fallback_project.to_string());
        Self { project, config }
    }

    /// Load `.skiff.yml` from `dir`; the directory name is the fallback project name.
    pub fn from_dir(dir: &Path) -> Result<Self, TargetError> {
        let config = ProjectConfig::load(dir)?;
        let fallback = dir
            .canonicalize()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| "skiff".to_string());
        Ok(Self::new(config, &fallback))
    }

    pub fn project(&self) -> &str { &self.project }

    pub fn targets(&self) -> &[TargetConfig] { &self.config.targets }

    /// Resolve `name`, applying `overrides`. Never touches the network.
    pub fn resolve(&self, name: &str, overrides: &Overrides) -> Result<Target, TargetError> {
        let cfg = self
            .config
            .targets
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| TargetError::UnknownTarget(name.to_string()))?;

        let mut context = cfg.context.clone();
        let mut namespace = cfg.namespace.clone().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let mut args = cfg.args.clone();
        for (key, value) in overrides {
            match key.as_str() {
                "context" => context = Some(value.clone()),
                "namespace" => namespace = value.clone(),
                k if args.contains_key(k) => {
                    args.insert(k.to_string(), parse_arg_value(value));
                }
                _ => return Err(TargetError::InvalidOverride { target: name.to_string(), key: key.clone() }),
            }
        }

        info!(project = %self.project, target = %name, context = ?context, namespace = %namespace, "target resolved");
        Ok(Target {
            project: self.project.clone(),
            name: name.to_string(),
            context: ClusterContext::new(context),
            namespace,
            args,
        })
    }
}

/// Parse `key=value` items into overrides.
pub fn parse_args(items: &[String]) -> Result<Overrides, TargetError> {
    let mut out = Overrides::new();
    for item in items {
        match item.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                out.insert(k.trim().to_string(), v.to_string());
            }
            _ => return Err(TargetError::MalformedArg(item.clone())),
        }
    }
    Ok(out)
}

/// Interpret an override value as a YAML scalar (`3`, `true`, `text`).
fn parse_arg_value(raw: &str) -> Json {
    if raw.is_empty() {
        return Json::String(String::new());
    }
    match serde_yaml::from_str::<Json>(raw) {
        Ok(v @ (Json::Bool(_) | Json::Number(_) | Json::String(_))) => v,
        _ => Json::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
project: simple
targets:
  - name: test
    context: kind-module
    namespace: simple
    args:
      environment: test
      replicas: 1
  - name: prod
"#;

    fn resolver() -> TargetResolver {
        TargetResolver::new(ProjectConfig::from_yaml(CONFIG).unwrap(), "fallback")
    }

    #[test]
    fn resolves_declared_target() {
        let t = resolver().resolve("test", &Overrides::new()).unwrap();
        assert_eq!(t.project, "simple");
        assert_eq!(t.namespace, "simple");
        assert_eq!(t.context.context_name(), Some("kind-module"));
        assert!(!t.context.is_connected());
        assert_eq!(t.args["environment"], "test");
    }

    #[test]
    fn defaults_apply_to_minimal_target() {
        let t = resolver().resolve("prod", &Overrides::new()).unwrap();
        assert_eq!(t.namespace, DEFAULT_NAMESPACE);
        assert_eq!(t.context.context_name(), None);
    }

    #[test]
    fn unknown_target_fails() {
        let err = resolver().resolve("staging", &Overrides::new()).unwrap_err();
        assert!(matches!(err, TargetError::UnknownTarget(n) if n == "staging"));
    }

    #[test]
    fn overrides_are_checked_against_target_args() {
        let r = resolver();
        let ok = parse_args(&["replicas=3".into(), "namespace=other".into(), "context=kind-b".into()]).unwrap();
        let t = r.resolve("test", &ok).unwrap();
        assert_eq!(t.args["replicas"], 3);
        assert_eq!(t.namespace, "other");
        assert_eq!(t.context.context_name(), Some("kind-b"));

        let bad = parse_args(&["colour=blue".into()]).unwrap();
        let err = r.resolve("test", &bad).unwrap_err();
        assert!(matches!(err, TargetError::InvalidOverride { ref key, .. } if key == "colour"));
        // prod declares no args, so only builtins are accepted
        let err = r.resolve("prod", &parse_args(&["environment=x".into()]).unwrap()).unwrap_err();
        assert!(matches!(err, TargetError::InvalidOverride { .. }));
    }

    #[test]
    fn resolving_twice_gives_independent_contexts() {
        let r = resolver();
        let a = r.resolve("test", &Overrides::new()).unwrap();
        let b = r.resolve("test", &Overrides::new()).unwrap();
        assert_eq!(a.name, b.name);
        assert_eq!(a.namespace, b.namespace);
        assert!(!a.context.is_connected() && !b.context.is_connected());
    }

    #[test]
    fn config_validation() {
        let dup = "targets:\n  - name: a\n  - name: a\n";
        assert!(matches!(ProjectConfig::from_yaml(dup), Err(TargetError::Config(_))));
        let shadow = "targets:\n  - name: a\n    args:\n      namespace: x\n";
        assert!(matches!(ProjectConfig::from_yaml(shadow), Err(TargetError::Config(_))));
        let unknown = "targets:\n  - name: a\n    colour: red\n";
        assert!(ProjectConfig::from_yaml(unknown).is_err());
    }

    #[test]
    fn malformed_args() {
        assert!(matches!(parse_args(&["novalue".into()]), Err(TargetError::MalformedArg(_))));
        assert!(matches!(parse_args(&["=x".into()]), Err(TargetError::MalformedArg(_))));
        let o = parse_args(&["a=b=c".into()]).unwrap();
        assert_eq!(o["a"], "b=c");
    }

    #[test]
    fn loads_project_file_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".skiff.yml"), "targets:\n  - name: test\n").unwrap();
        let r = TargetResolver::from_dir(dir.path()).unwrap();
        assert_eq!(r.targets().len(), 1);
        // project name falls back to the directory name
        let expected = dir.path().canonicalize().unwrap().file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(r.project(), expected);

        let empty = tempfile::tempdir().unwrap();
        assert!(matches!(TargetResolver::from_dir(empty.path()), Err(TargetError::Config(_))));
    }
}
