//! Core types for declarative operator installs: requests, cluster objects,
//! the subscription manifest and the object filter. No I/O lives here.

#![forbid(unsafe_code)]

pub mod filter;
pub mod manifest;
pub mod object;
pub mod request;

pub use filter::{classify_by_kind, filter, subscriptions};
pub use manifest::build_manifest;
pub use object::{Gvk, Object, ObjectError, ObjectKey, RecordStatus, SubscriptionStatus};
pub use request::{ApprovalMode, InstallRequest, RequestError};

/// API group served by the subscription controller.
pub const OPERATORS_GROUP: &str = "operators.coreos.com";
/// API version of subscriptions and resolved-version records.
pub const OPERATORS_VERSION: &str = "v1alpha1";
pub const SUBSCRIPTION_KIND: &str = "Subscription";
pub const CLUSTER_SERVICE_VERSION_KIND: &str = "ClusterServiceVersion";

pub mod prelude {
    pub use super::{
        build_manifest, classify_by_kind, subscriptions, ApprovalMode, Gvk, InstallRequest, Object, ObjectKey,
        RecordStatus, SubscriptionStatus,
    };
}
