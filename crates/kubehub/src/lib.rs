//! Cluster gateway: the create/delete/get/list surface the installer drives.
//!
//! [`KubeGateway`] talks to a live apiserver through kube-rs; [`MemoryGateway`]
//! keeps objects in process for tests and offline runs.

#![forbid(unsafe_code)]

use std::fmt;

use olm_core::{Gvk, Object, ObjectKey};

mod connect;
mod kube_gateway;
mod memory;

pub use connect::{connect, ConnectOptions};
pub use kube_gateway::{GatewayConfig, KubeGateway};
pub use memory::{MemoryGateway, Reactor};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Gateway verb, carried in errors for diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayOp {
    Create,
    Delete,
    Get,
    List,
}

impl fmt::Display for GatewayOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GatewayOp::Create => "create",
            GatewayOp::Delete => "delete",
            GatewayOp::Get => "get",
            GatewayOp::List => "list",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The apiserver answered, and the object does not exist.
    #[error("{gvk} {key} not found")]
    NotFound { gvk: Gvk, key: ObjectKey },
    /// Anything else: auth, network, malformed object, server errors.
    #[error("{op} {gvk} {key}: {source}")]
    Transport {
        op: GatewayOp,
        gvk: Gvk,
        key: ObjectKey,
        #[source]
        source: BoxError,
    },
}

impl GatewayError {
    pub fn transport(op: GatewayOp, gvk: &Gvk, key: &ObjectKey, source: impl Into<BoxError>) -> Self {
        GatewayError::Transport { op, gvk: gvk.clone(), key: key.clone(), source: source.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound { .. })
    }

    pub fn key(&self) -> &ObjectKey {
        match self {
            GatewayError::NotFound { key, .. } | GatewayError::Transport { key, .. } => key,
        }
    }
}

/// Capability surface over cluster objects. Implementations hold the connection;
/// callers share one instance across concurrent installs.
#[async_trait::async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Create every object in order, stopping at the first failure.
    /// An object that already exists counts as created.
    async fn create(&self, objects: &[Object]) -> Result<(), GatewayError>;

    /// Delete every object in order, stopping at the first failure.
    /// An object that is already gone counts as deleted.
    async fn delete(&self, objects: &[Object]) -> Result<(), GatewayError>;

    /// Fetch the live form of one object. Absence is [`GatewayError::NotFound`].
    async fn get(&self, key: &ObjectKey, gvk: &Gvk) -> Result<Object, GatewayError>;

    /// All objects of `gvk` in `namespace`; an empty namespace lists across all of them.
    async fn list(&self, namespace: &str, gvk: &Gvk) -> Result<Vec<Object>, GatewayError>;
}
