//! Install request -> subscription manifest.

use serde_json::json;

use crate::{
    object::{Gvk, Object},
    request::InstallRequest,
    SUBSCRIPTION_KIND,
};

/// Objects implied by `request`. Pure: equal requests produce equal manifests.
///
/// The request name is used both as the subscription name and as the package
/// to subscribe to.
pub fn build_manifest(request: &InstallRequest) -> Vec<Object> {
    let raw = json!({
        "apiVersion": Gvk::subscription().api_version(),
        "kind": SUBSCRIPTION_KIND,
        "metadata": {
            "name": request.name,
            "namespace": request.namespace,
        },
        "spec": {
            "name": request.name,
            "channel": request.channel,
            "source": request.source_catalog,
            "sourceNamespace": request.source_catalog_namespace,
            "installPlanApproval": request.approval_mode.as_str(),
        }
    });
    // Identity fields are always present above, so the only failure is an empty name,
    // which validation rejects before anything reaches the cluster.
    Object::from_raw(raw).into_iter().collect()
}
