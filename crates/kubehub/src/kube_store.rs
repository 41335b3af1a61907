//! kube-rs backed object store: dynamic objects addressed through discovery.

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions},
    core::DynamicObject,
    discovery::{verbs, ApiCapabilities, ApiResource, Discovery, Scope as KubeScope},
};
use metrics::counter;
use serde_json::Value as Json;
use skiff_core::{Document, LabelSelector, LiveObject, ObjectRef, Scope, FIELD_MANAGER};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::{ApplyMode, ApplyOptions, ClusterContext, ObjectStore, StoreError};

/// Object store talking to the API server of one [`ClusterContext`].
///
/// Discovery runs once per store, i.e. once per deploy invocation.
pub struct KubeStore {
    ctx: ClusterContext,
    discovery: OnceCell<Discovery>,
}

impl KubeStore {
    pub fn new(ctx: ClusterContext) -> Self {
        Self { ctx, discovery: OnceCell::new() }
    }

    async fn discovery(&self) -> Result<&Discovery, StoreError> {
        self.discovery
            .get_or_try_init(|| async {
                let client = self.ctx.client().await?;
                let t0 = std::time::Instant::now();
                let discovery = Discovery::new(client)
                    .run()
                    .await
                    .map_err(|e| StoreError::from_kube(e, &"discovery"))?;
                info!(groups = discovery.groups().count(), took_ms = %t0.elapsed().as_millis(), "discovery done");
                Ok(discovery)
            })
            .await
    }

    /// Resolve `group/kind` to the resource at its recommended version.
    async fn find_api_resource(&self, group: &str, kind: &str) -> Result<(ApiResource, ApiCapabilities), StoreError> {
        let discovery = self.discovery().await?;
        discovery
            .get(group)
            .and_then(|g| g.recommended_kind(kind))
            .ok_or_else(|| StoreError::Rejected(format!("no served API resource for {}/{}", group, kind)))
    }

    async fn api_for(&self, id: &ObjectRef) -> Result<(Api<DynamicObject>, ApiResource, bool), StoreError> {
        let (ar, caps) = self.find_api_resource(&id.group, &id.kind).await?;
        let client = self.ctx.client().await?;
        let namespaced = matches!(caps.scope, KubeScope::Namespaced);
        let api: Api<DynamicObject> = if namespaced {
            match id.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(client, ns, &ar),
                None => return Err(StoreError::Rejected(format!("{}: namespace required for namespaced kind", id))),
            }
        } else {
            Api::all_with(client, &ar)
        };
        Ok((api, ar, namespaced))
    }

    /// Every discovered resource that supports `list`.
    async fn listable(&self) -> Result<Vec<(ApiResource, ApiCapabilities)>, StoreError> {
        let discovery = self.discovery().await?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if caps.supports_operation(verbs::LIST) {
                    out.push((ar, caps));
                }
            }
        }
        // Stable-ish order
        out.sort_by(|a, b| a.0.group.cmp(&b.0.group).then(a.0.kind.cmp(&b.0.kind)));
        Ok(out)
    }

    async fn list_kind(&self, ar: &ApiResource, caps: &ApiCapabilities, lp: &ListParams) -> Result<Vec<LiveObject>, StoreError> {
        let client = self.ctx.client().await?;
        let api: Api<DynamicObject> = Api::all_with(client, ar);
        let namespaced = matches!(caps.scope, KubeScope::Namespaced);
        let kind_key = if ar.group.is_empty() { ar.kind.clone() } else { format!("{}/{}", ar.group, ar.kind) };
        let list = api.list(lp).await.map_err(|e| StoreError::from_kube(e, &kind_key))?;
        let mut out = Vec::with_capacity(list.items.len());
        for obj in list.items {
            let Some(name) = obj.metadata.name.clone() else { continue };
            let namespace = if namespaced { obj.metadata.namespace.clone() } else { None };
            let id = ObjectRef { group: ar.group.clone(), kind: ar.kind.clone(), namespace, name };
            out.push(to_live(id, &obj)?);
        }
        debug!(kind = %kind_key, count = out.len(), "listed");
        Ok(out)
    }
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

fn to_live(id: ObjectRef, obj: &DynamicObject) -> Result<LiveObject, StoreError> {
    let mut body = serde_json::to_value(obj).map_err(|e| StoreError::Rejected(format!("{}: serializing live object: {}", id, e)))?;
    strip_managed_fields(&mut body);
    Ok(LiveObject::from_body(id, body))
}

fn with_resource_version(body: &Json, rv: Option<&str>) -> Json {
    let mut body = body.clone();
    if let (Some(rv), Some(meta)) = (rv, body.get_mut("metadata").and_then(|m| m.as_object_mut())) {
        meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
    }
    body
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn scope(&self, group: &str, kind: &str) -> Result<Scope, StoreError> {
        let (_ar, caps) = self.find_api_resource(group, kind).await?;
        Ok(match caps.scope {
            KubeScope::Namespaced => Scope::Namespaced,
            KubeScope::Cluster => Scope::Cluster,
        })
    }

    async fn get(&self, id: &ObjectRef) -> Result<LiveObject, StoreError> {
        let (api, _ar, _namespaced) = self.api_for(id).await?;
        match api.get_opt(&id.name).await.map_err(|e| StoreError::from_kube(e, id))? {
            Some(obj) => to_live(id.clone(), &obj),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    fn list<'a>(&'a self, selector: &'a LabelSelector) -> BoxStream<'a, Result<LiveObject, StoreError>> {
        let lp = ListParams::default().labels(&selector.to_string());
        futures::stream::once(self.listable())
            .map_ok(|resources| futures::stream::iter(resources.into_iter().map(Ok::<_, StoreError>)))
            .try_flatten()
            .and_then(move |(ar, caps)| {
                let lp = lp.clone();
                async move { self.list_kind(&ar, &caps, &lp).await }
            })
            .map_ok(|items| futures::stream::iter(items.into_iter().map(Ok::<_, StoreError>)))
            .try_flatten()
            .boxed()
    }

    async fn apply(&self, id: &ObjectRef, doc: &Document, expected_rv: Option<&str>, opts: &ApplyOptions) -> Result<LiveObject, StoreError> {
        let (api, _ar, _namespaced) = self.api_for(id).await?;
        let body = with_resource_version(&doc.body, expected_rv);
        let res = match opts.mode {
            ApplyMode::ServerSide => {
                let mut pp = PatchParams::apply(FIELD_MANAGER);
                if opts.force_conflicts {
                    pp = pp.force();
                }
                api.patch(&id.name, &pp, &Patch::Apply(&body)).await
            }
            ApplyMode::Replace => {
                let obj: DynamicObject = serde_json::from_value(body)
                    .map_err(|e| StoreError::Rejected(format!("{}: {}", id, e)))?;
                let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
                match expected_rv {
                    Some(_) => api.replace(&id.name, &pp, &obj).await,
                    None => api.create(&pp, &obj).await,
                }
            }
        };
        match res {
            Ok(obj) => {
                counter!("store_apply_ok", 1u64);
                to_live(id.clone(), &obj)
            }
            Err(e) => {
                counter!("store_apply_err", 1u64);
                Err(StoreError::from_kube(e, id))
            }
        }
    }

    async fn delete(&self, id: &ObjectRef, expected_rv: Option<&str>) -> Result<(), StoreError> {
        let (api, _ar, _namespaced) = self.api_for(id).await?;
        let dp = DeleteParams {
            preconditions: expected_rv.map(|rv| Preconditions { resource_version: Some(rv.to_string()), uid: None }),
            ..Default::default()
        };
        api.delete(&id.name, &dp).await.map_err(|e| StoreError::from_kube(e, id))?;
        counter!("store_delete_ok", 1u64);
        Ok(())
    }
}
