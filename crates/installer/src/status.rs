//! Status aggregation: fetch every object's live form and reduce to one verdict.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use olm_core::{Gvk, Object, ObjectKey, RecordStatus, SubscriptionStatus};
use olm_kubehub::{ClusterGateway, GatewayError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::InstallError;

/// What a live fetch of one object produced.
#[derive(Debug, Clone)]
pub enum ObjectOutcome {
    Found(Object),
    NotFound,
    Failed(Arc<GatewayError>),
}

#[derive(Debug, Clone)]
pub struct ObjectStatus {
    pub gvk: Gvk,
    pub key: ObjectKey,
    pub outcome: ObjectOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Installed,
    NotInstalled,
    Errored,
}

/// Aggregate over a set of objects as observed at `observed_at`.
#[derive(Debug, Clone)]
pub struct StatusView {
    pub objects: Vec<ObjectStatus>,
    pub observed_at: DateTime<Utc>,
}

impl StatusView {
    pub fn new(objects: Vec<ObjectStatus>) -> Self {
        Self { objects, observed_at: Utc::now() }
    }

    /// `Ok(true)` only when every object was found; `Ok(false)` when something is
    /// missing and nothing errored; `Err` on any hard error. An empty set is not installed.
    pub fn has_installed_resources(&self) -> Result<bool, InstallError> {
        if let Some(err) = self.first_error() {
            return Err(InstallError::Transport(err));
        }
        let all_found = self.objects.iter().all(|o| matches!(o.outcome, ObjectOutcome::Found(_)));
        Ok(!self.objects.is_empty() && all_found)
    }

    pub fn verdict(&self) -> Verdict {
        match self.has_installed_resources() {
            Ok(true) => Verdict::Installed,
            Ok(false) => Verdict::NotInstalled,
            Err(_) => Verdict::Errored,
        }
    }

    pub fn first_error(&self) -> Option<Arc<GatewayError>> {
        self.objects.iter().find_map(|o| match &o.outcome {
            ObjectOutcome::Failed(e) => Some(e.clone()),
            _ => None,
        })
    }

    pub fn found(&self) -> impl Iterator<Item = &Object> {
        self.objects.iter().filter_map(|o| match &o.outcome {
            ObjectOutcome::Found(obj) => Some(obj),
            _ => None,
        })
    }

    pub fn missing(&self) -> impl Iterator<Item = &ObjectKey> {
        self.objects.iter().filter(|o| matches!(o.outcome, ObjectOutcome::NotFound)).map(|o| &o.key)
    }

    pub fn summary(&self) -> StatusSummary {
        let objects = self
            .objects
            .iter()
            .map(|o| {
                let (state, detail, error) = match &o.outcome {
                    ObjectOutcome::Found(obj) => ("found", describe(obj), None),
                    ObjectOutcome::NotFound => ("not_found", None, None),
                    ObjectOutcome::Failed(e) => ("error", None, Some(e.to_string())),
                };
                ObjectSummary {
                    gvk: o.gvk.to_string(),
                    namespace: o.key.namespace.clone(),
                    name: o.key.name.clone(),
                    state: state.to_string(),
                    detail,
                    error,
                }
            })
            .collect();
        StatusSummary { verdict: self.verdict(), observed_at: self.observed_at, objects }
    }
}

// Subscriptions report the version they resolved to, records their phase.
fn describe(obj: &Object) -> Option<String> {
    let detail = if obj.is_kind(&Gvk::subscription()) {
        obj.status::<SubscriptionStatus>().map(|st| st.resolved().map(|csv| format!("installed {csv}")))
    } else {
        obj.status::<RecordStatus>().map(|st| st.phase().map(|p| format!("phase {p}")))
    };
    detail.unwrap_or_else(|e| Some(e.to_string()))
}

/// Serialisable digest of a [`StatusView`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub verdict: Verdict,
    pub observed_at: DateTime<Utc>,
    pub objects: Vec<ObjectSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub gvk: String,
    pub namespace: String,
    pub name: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fans a live `get` out over a set of objects. Not-found and hard errors are
/// recorded per object; one failure never stops the rest.
pub struct StatusAggregator {
    gateway: Arc<dyn ClusterGateway>,
}

impl StatusAggregator {
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        Self { gateway }
    }

    pub async fn aggregate(&self, objects: &[Object]) -> StatusView {
        let fetches = objects.iter().map(|obj| async move {
            let (gvk, key) = (obj.gvk().clone(), obj.key().clone());
            let outcome = match self.gateway.get(&key, &gvk).await {
                Ok(live) => ObjectOutcome::Found(live),
                Err(e) if e.is_not_found() => {
                    debug!(gvk = %gvk, key = %key, "not found");
                    ObjectOutcome::NotFound
                }
                Err(e) => {
                    warn!(gvk = %gvk, key = %key, error = %e, "status fetch failed");
                    ObjectOutcome::Failed(Arc::new(e))
                }
            };
            ObjectStatus { gvk, key, outcome }
        });
        StatusView::new(join_all(fetches).await)
    }
}
