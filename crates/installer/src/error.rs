use std::{sync::Arc, time::Duration};

use olm_core::{Gvk, Object, ObjectError, ObjectKey, RequestError};
use olm_kubehub::{GatewayError, GatewayOp};

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("invalid install request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("failed to create subscriptions: {0}")]
    CreateFailed(#[source] GatewayError),

    #[error("failed to delete operator resources: {0}")]
    DeleteFailed(#[source] GatewayError),

    #[error("subscription {subscription} did not resolve an installed version within {waited:?} (last state: {})", .last_state.as_deref().unwrap_or("<none>"))]
    ResolutionTimeout { subscription: ObjectKey, waited: Duration, last_state: Option<String> },

    #[error("subscription {subscription}: {record} did not reach the success phase within {waited:?} (last phase: {})", .last_phase.as_deref().unwrap_or("<none>"))]
    ConvergenceTimeout { subscription: ObjectKey, record: ObjectKey, waited: Duration, last_phase: Option<String> },

    #[error("subscription {subscription}: {record} entered phase {phase} (reason: {}, message: {})", .reason.as_deref().unwrap_or("-"), .message.as_deref().unwrap_or("-"))]
    InstallFailed {
        subscription: ObjectKey,
        record: ObjectKey,
        phase: String,
        reason: Option<String>,
        message: Option<String>,
    },

    #[error("{gvk} {key} not found")]
    NotFound { gvk: Gvk, key: ObjectKey },

    /// Auth, network, or malformed-object failure talking to the cluster.
    #[error("cluster request failed: {0}")]
    Transport(#[source] Arc<GatewayError>),

    #[error("operator {name} is not installed in namespace {namespace}")]
    NotInstalled { name: String, namespace: String },

    /// Uninstall refused: the install exists but never reached the success phase.
    #[error("subscription {subscription}: {record} is in phase {} and has not succeeded; refusing to uninstall", .phase.as_deref().unwrap_or("<none>"))]
    NotSucceeded { subscription: ObjectKey, record: ObjectKey, phase: Option<String> },

    /// The cluster answered fine, but the objects are not all there.
    #[error("operator {name} installation verification failed: resources are not installed as expected")]
    VerificationFailed { name: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl InstallError {
    /// Lift a gateway failure into the taxonomy: not-found stays distinct, the rest is transport.
    pub fn from_gateway(err: GatewayError) -> Self {
        match err {
            GatewayError::NotFound { gvk, key } => InstallError::NotFound { gvk, key },
            other => InstallError::Transport(Arc::new(other)),
        }
    }

    /// A fetched object whose status does not decode. Reported as a hard transport failure.
    pub fn malformed(obj: &Object, err: ObjectError) -> Self {
        InstallError::Transport(Arc::new(GatewayError::transport(GatewayOp::Get, obj.gvk(), obj.key(), err)))
    }

    pub fn is_not_installed(&self) -> bool {
        matches!(self, InstallError::NotInstalled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, InstallError::ResolutionTimeout { .. } | InstallError::ConvergenceTimeout { .. })
    }
}
