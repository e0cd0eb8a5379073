//! Install requests: the declared "operator X on channel Y" intent.

use std::{fmt, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_NAMESPACE: &str = "operators";
pub const DEFAULT_SOURCE: &str = "operatorhubio-catalog";
pub const DEFAULT_SOURCE_NAMESPACE: &str = "olm";

// RFC 1123 label, as enforced by the apiserver for namespaces and most object names.
static DNS_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));
// RFC 1123 subdomain: dot-separated labels. Subscription and package names follow this rule.
static DNS_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("static regex")
});

/// Whether install-plan upgrades apply automatically or wait for a manual approval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApprovalMode {
    #[default]
    Automatic,
    Manual,
}

impl ApprovalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalMode::Automatic => "Automatic",
            ApprovalMode::Manual => "Manual",
        }
    }
}

impl fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalMode {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("automatic") {
            Ok(ApprovalMode::Automatic)
        } else if s.eq_ignore_ascii_case("manual") {
            Ok(ApprovalMode::Manual)
        } else {
            Err(RequestError::Approval(s.to_string()))
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} {value:?} is not a valid RFC 1123 name (lowercase alphanumerics, '-' and, for subdomains, '.')")]
    InvalidName { field: &'static str, value: String },
    #[error("unknown approval mode {0:?} (expect Automatic or Manual)")]
    Approval(String),
}

/// One desired operator installation. The name doubles as the package name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstallRequest {
    pub name: String,
    pub namespace: String,
    pub channel: String,
    pub source_catalog: String,
    pub source_catalog_namespace: String,
    pub approval_mode: ApprovalMode,
}

impl InstallRequest {
    /// Request with the provider defaults for everything but name and channel.
    pub fn new(name: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            channel: channel.into(),
            source_catalog: DEFAULT_SOURCE.to_string(),
            source_catalog_namespace: DEFAULT_SOURCE_NAMESPACE.to_string(),
            approval_mode: ApprovalMode::default(),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn source(mut self, catalog: impl Into<String>, catalog_namespace: impl Into<String>) -> Self {
        self.source_catalog = catalog.into();
        self.source_catalog_namespace = catalog_namespace.into();
        self
    }

    pub fn approval(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        check_subdomain("name", &self.name)?;
        check_label("namespace", &self.namespace)?;
        check_label("source catalog namespace", &self.source_catalog_namespace)?;
        if self.channel.trim().is_empty() {
            return Err(RequestError::Empty { field: "channel" });
        }
        if self.source_catalog.trim().is_empty() {
            return Err(RequestError::Empty { field: "source catalog" });
        }
        Ok(())
    }
}

fn check_subdomain(field: &'static str, value: &str) -> Result<(), RequestError> {
    if value.is_empty() {
        return Err(RequestError::Empty { field });
    }
    if value.len() > 253 || !DNS_SUBDOMAIN.is_match(value) {
        return Err(RequestError::InvalidName { field, value: value.to_string() });
    }
    Ok(())
}

fn check_label(field: &'static str, value: &str) -> Result<(), RequestError> {
    if value.is_empty() {
        return Err(RequestError::Empty { field });
    }
    if value.len() > 63 || !DNS_LABEL.is_match(value) {
        return Err(RequestError::InvalidName { field, value: value.to_string() });
    }
    Ok(())
}
