use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    discovery::{Discovery, Scope},
    Client,
};
use olm_core::{Gvk, Object, ObjectKey};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{ClusterGateway, GatewayError, GatewayOp};

/// Knobs for the kube-backed gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How long `delete` waits for deleted objects to disappear.
    pub deletion_timeout: Duration,
    pub deletion_poll: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { deletion_timeout: Duration::from_secs(60), deletion_poll: Duration::from_secs(1) }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let deletion_timeout = std::env::var("OLMCTL_DELETE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.deletion_timeout);
        Self { deletion_timeout, ..d }
    }
}

/// Gateway over a live apiserver. API resources are discovered once per GVK and cached.
pub struct KubeGateway {
    client: Client,
    config: GatewayConfig,
    resources: RwLock<HashMap<Gvk, (ApiResource, bool)>>,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        Self::with_config(client, GatewayConfig::default())
    }

    pub fn with_config(client: Client, config: GatewayConfig) -> Self {
        Self { client, config, resources: RwLock::new(HashMap::new()) }
    }

    async fn api_resource(&self, gvk: &Gvk, op: GatewayOp, key: &ObjectKey) -> Result<(ApiResource, bool), GatewayError> {
        if let Some(found) = self.resources.read().await.get(gvk) {
            return Ok(found.clone());
        }
        let target = GroupVersionKind { group: gvk.group.clone(), version: gvk.version.clone(), kind: gvk.kind.clone() };
        let found = find_api_resource(self.client.clone(), &target)
            .await
            .map_err(|e| GatewayError::transport(op, gvk, key, e))?;
        debug!(gvk = %gvk, plural = %found.0.plural, namespaced = found.1, "api resource discovered");
        self.resources.write().await.insert(gvk.clone(), found.clone());
        Ok(found)
    }

    async fn api(&self, gvk: &Gvk, key: &ObjectKey, op: GatewayOp) -> Result<(Api<DynamicObject>, ApiResource), GatewayError> {
        let (ar, namespaced) = self.api_resource(gvk, op, key).await?;
        let api = if namespaced && !key.namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), &key.namespace, &ar)
        } else if namespaced {
            return Err(GatewayError::transport(op, gvk, key, "namespace required for namespaced kind"));
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok((api, ar))
    }

    async fn wait_gone(&self, pending: Vec<(Api<DynamicObject>, Gvk, ObjectKey)>) -> Result<(), GatewayError> {
        let deadline = tokio::time::Instant::now() + self.config.deletion_timeout;
        for (api, gvk, key) in pending {
            loop {
                match api.get_opt(&key.name).await {
                    Ok(None) => break,
                    Ok(Some(_)) if tokio::time::Instant::now() >= deadline => {
                        return Err(GatewayError::transport(
                            GatewayOp::Delete,
                            &gvk,
                            &key,
                            format!("still present {:?} after delete", self.config.deletion_timeout),
                        ));
                    }
                    Ok(Some(_)) => tokio::time::sleep(self.config.deletion_poll).await,
                    Err(e) => return Err(map_kube_error(GatewayOp::Delete, &gvk, &key, e)),
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn create(&self, objects: &[Object]) -> Result<(), GatewayError> {
        let pp = PostParams::default();
        for obj in objects {
            let (gvk, key) = (obj.gvk(), obj.key());
            let (api, _) = self.api(gvk, key, GatewayOp::Create).await?;
            let dynobj: DynamicObject = serde_json::from_value(obj.raw().clone())
                .map_err(|e| GatewayError::transport(GatewayOp::Create, gvk, key, e))?;
            match api.create(&pp, &dynobj).await {
                Ok(_) => info!(gvk = %gvk, key = %key, "created"),
                Err(kube::Error::Api(ae)) if ae.code == 409 => debug!(gvk = %gvk, key = %key, "already exists"),
                Err(e) => return Err(map_kube_error(GatewayOp::Create, gvk, key, e)),
            }
        }
        Ok(())
    }

    async fn delete(&self, objects: &[Object]) -> Result<(), GatewayError> {
        let dp = DeleteParams::foreground();
        let mut pending = Vec::with_capacity(objects.len());
        for obj in objects {
            let (gvk, key) = (obj.gvk(), obj.key());
            let (api, _) = self.api(gvk, key, GatewayOp::Delete).await?;
            match api.delete(&key.name, &dp).await {
                Ok(_) => {
                    info!(gvk = %gvk, key = %key, "deleted");
                    pending.push((api, gvk.clone(), key.clone()));
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => debug!(gvk = %gvk, key = %key, "already gone"),
                Err(e) => return Err(map_kube_error(GatewayOp::Delete, gvk, key, e)),
            }
        }
        self.wait_gone(pending).await
    }

    async fn get(&self, key: &ObjectKey, gvk: &Gvk) -> Result<Object, GatewayError> {
        let (api, ar) = self.api(gvk, key, GatewayOp::Get).await?;
        let obj = api.get(&key.name).await.map_err(|e| map_kube_error(GatewayOp::Get, gvk, key, e))?;
        to_object(obj, &ar).map_err(|e| GatewayError::transport(GatewayOp::Get, gvk, key, e))
    }

    async fn list(&self, namespace: &str, gvk: &Gvk) -> Result<Vec<Object>, GatewayError> {
        let scope = ObjectKey::new(namespace, "*");
        let (ar, namespaced) = self.api_resource(gvk, GatewayOp::List, &scope).await?;
        let api: Api<DynamicObject> = if namespaced && !namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error(GatewayOp::List, gvk, &scope, e))?;
        let mut out = Vec::with_capacity(list.items.len());
        for item in list.items {
            match to_object(item, &ar) {
                Ok(o) => out.push(o),
                Err(e) => warn!(gvk = %gvk, error = %e, "skipping unreadable list item"),
            }
        }
        Ok(out)
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> anyhow::Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).filter(&[gvk.group.as_str()]).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow::anyhow!("GVK not served: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

pub(crate) fn map_kube_error(op: GatewayOp, gvk: &Gvk, key: &ObjectKey, err: kube::Error) -> GatewayError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => GatewayError::NotFound { gvk: gvk.clone(), key: key.clone() },
        other => GatewayError::transport(op, gvk, key, other),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

// List items may come back without apiVersion/kind; fill them from the resource.
fn to_object(mut obj: DynamicObject, ar: &ApiResource) -> anyhow::Result<Object> {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    }
    let mut raw = serde_json::to_value(&obj)?;
    strip_managed_fields(&mut raw);
    Ok(Object::from_raw(raw)?)
}
