//! Skiff kubehub – the object store adapter between the reconciler and a cluster.
//!
//! [`ObjectStore`] is the only way the rest of the workspace touches cluster
//! state. [`KubeStore`] talks to a real API server through kube-rs dynamic
//! objects; [`MemoryStore`] keeps objects in process for tests and offline runs.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::{config::KubeConfigOptions, Client, Config};
use skiff_core::{Document, LabelSelector, LiveObject, ObjectRef, Scope};
use tokio::sync::OnceCell;
use tracing::debug;

mod kube_store;
mod mem;
pub mod retry;

pub use kube_store::KubeStore;
pub use mem::{MemoryStore, Op};
pub use retry::{retry_transient, RetryPolicy};

/// Failure taxonomy of every store operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The object does not exist. Callers decide whether that is an error.
    #[error("not found: {0}")]
    NotFound(String),
    /// Optimistic concurrency precondition failed.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Network/timeout/throttling; retrying may help.
    #[error("transient: {0}")]
    Transient(String),
    /// The server refused this object (invalid, unknown kind, ...). Not retried.
    #[error("rejected: {0}")]
    Rejected(String),
    /// Authentication/authorization or client setup failure. Aborts the pass.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }
    pub fn is_transient(&self) -> bool { matches!(self, StoreError::Transient(_)) }
    pub fn is_fatal(&self) -> bool { matches!(self, StoreError::Fatal(_)) }

    /// Classify a kube-rs error for the object `what` refers to.
    pub fn from_kube(err: kube::Error, what: &dyn fmt::Display) -> Self {
        match err {
            kube::Error::Api(ae) => {
                let msg = format!("{}: {} ({})", what, ae.message, ae.reason);
                match ae.code {
                    404 => StoreError::NotFound(msg),
                    409 => StoreError::Conflict(msg),
                    401 | 403 => StoreError::Fatal(msg),
                    408 | 429 | 500..=599 => StoreError::Transient(msg),
                    _ => StoreError::Rejected(msg),
                }
            }
            kube::Error::HyperError(e) => StoreError::Transient(format!("{}: {}", what, e)),
            kube::Error::Service(e) => StoreError::Transient(format!("{}: {}", what, e)),
            kube::Error::SerdeError(e) => StoreError::Rejected(format!("{}: {}", what, e)),
            other => StoreError::Fatal(format!("{}: {}", what, other)),
        }
    }
}

/// How `apply` writes an object that already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApplyMode {
    /// Server-side apply: only the declared fields are owned and merged.
    #[default]
    ServerSide,
    /// Full replace of the object body.
    Replace,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    pub mode: ApplyMode,
    /// Take over fields owned by other field managers.
    pub force_conflicts: bool,
}

/// Cluster API as seen by the reconciler.
///
/// Every call is a suspension point; nothing else in the workspace blocks.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether `group/kind` is namespaced or cluster-scoped.
    async fn scope(&self, group: &str, kind: &str) -> Result<Scope, StoreError>;

    async fn get(&self, id: &ObjectRef) -> Result<LiveObject, StoreError>;

    /// Lazily list live objects matching `selector` across all kinds.
    /// Each call re-reads current state.
    fn list<'a>(&'a self, selector: &'a LabelSelector) -> BoxStream<'a, Result<LiveObject, StoreError>>;

    /// Create or merge `doc`. With `expected_rv` set, fails with
    /// [`StoreError::Conflict`] if the live resource version differs.
    async fn apply(&self, id: &ObjectRef, doc: &Document, expected_rv: Option<&str>, opts: &ApplyOptions) -> Result<LiveObject, StoreError>;

    /// Delete; [`StoreError::NotFound`] if already absent.
    async fn delete(&self, id: &ObjectRef, expected_rv: Option<&str>) -> Result<(), StoreError>;

    /// `get` with `NotFound` folded into `None`.
    async fn get_opt(&self, id: &ObjectRef) -> Result<Option<LiveObject>, StoreError> {
        match self.get(id).await {
            Ok(o) => Ok(Some(o)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Connection context of one resolved target.
///
/// The kube client is built on first use; cloning shares the same lazy
/// client, while separately created contexts never share one.
#[derive(Clone)]
pub struct ClusterContext {
    context: Option<String>,
    client: Arc<OnceCell<Client>>,
}

impl ClusterContext {
    /// `context` names a kubeconfig context; `None` uses the current one.
    pub fn new(context: Option<String>) -> Self {
        Self { context, client: Arc::new(OnceCell::new()) }
    }

    pub fn context_name(&self) -> Option<&str> { self.context.as_deref() }

    /// True once a client has been built.
    pub fn is_connected(&self) -> bool { self.client.initialized() }

    pub async fn client(&self) -> Result<Client, StoreError> {
        let client = self
            .client
            .get_or_try_init(|| async {
                debug!(context = ?self.context, "building kube client");
                let config = match &self.context {
                    Some(name) => {
                        let opts = KubeConfigOptions { context: Some(name.clone()), ..Default::default() };
                        Config::from_kubeconfig(&opts)
                            .await
                            .map_err(|e| StoreError::Fatal(format!("loading kubeconfig context {}: {}", name, e)))?
                    }
                    None => Config::infer().await.map_err(|e| StoreError::Fatal(format!("inferring kube config: {}", e)))?,
                };
                Client::try_from(config).map_err(|e| StoreError::Fatal(format!("building kube client: {}", e)))
            })
            .await?;
        Ok(client.clone())
    }
}

impl fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterContext")
            .field("context", &self.context)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Produces the object store for a resolved target's connection context.
pub trait Connector: Send + Sync {
    fn connect(&self, ctx: &ClusterContext) -> Arc<dyn ObjectStore>;
}

/// Connects through kube-rs.
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeConnector;

impl Connector for KubeConnector {
    fn connect(&self, ctx: &ClusterContext) -> Arc<dyn ObjectStore> {
        Arc::new(KubeStore::new(ctx.clone()))
    }
}
