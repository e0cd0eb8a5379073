//! Cluster object identity and the typed status views the installer reads.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{CLUSTER_SERVICE_VERSION_KIND, OPERATORS_GROUP, OPERATORS_VERSION, SUBSCRIPTION_KIND};

/// Group/Version/Kind of a cluster object. Core kinds use an empty group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    pub fn subscription() -> Self {
        Self::new(OPERATORS_GROUP, OPERATORS_VERSION, SUBSCRIPTION_KIND)
    }

    pub fn cluster_service_version() -> Self {
        Self::new(OPERATORS_GROUP, OPERATORS_VERSION, CLUSTER_SERVICE_VERSION_KIND)
    }

    /// Split an `apiVersion` (`group/version` or bare `version`) and pair it with a kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Namespaced name. Cluster-scoped objects carry an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() { write!(f, "{}", self.name) } else { write!(f, "{}/{}", self.namespace, self.name) }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ObjectError {
    #[error("object is not a JSON map")]
    NotAnObject,
    #[error("object missing {0}")]
    Missing(&'static str),
    #[error("malformed status: {0}")]
    MalformedStatus(String),
}

/// A cluster object in its raw JSON form, with identity parsed once up front.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    gvk: Gvk,
    key: ObjectKey,
    raw: Json,
}

impl Object {
    pub fn from_raw(raw: Json) -> Result<Self, ObjectError> {
        if !raw.is_object() {
            return Err(ObjectError::NotAnObject);
        }
        let api_version = raw.get("apiVersion").and_then(|v| v.as_str()).ok_or(ObjectError::Missing("apiVersion"))?;
        let kind = raw.get("kind").and_then(|v| v.as_str()).ok_or(ObjectError::Missing("kind"))?;
        let meta = raw.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(ObjectError::Missing("metadata.name"))?;
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).unwrap_or("");
        let gvk = Gvk::from_api_version(api_version, kind);
        let key = ObjectKey::new(namespace, name);
        Ok(Self { gvk, key, raw })
    }

    pub fn gvk(&self) -> &Gvk { &self.gvk }

    pub fn key(&self) -> &ObjectKey { &self.key }

    pub fn raw(&self) -> &Json { &self.raw }

    pub fn into_raw(self) -> Json { self.raw }

    pub fn is_kind(&self, gvk: &Gvk) -> bool { &self.gvk == gvk }

    /// Replace `.status` wholesale. Identity fields are untouched.
    pub fn with_status(mut self, status: Json) -> Self {
        if let Some(map) = self.raw.as_object_mut() {
            map.insert("status".into(), status);
        }
        self
    }

    /// Deserialize `.status` into a typed view. An absent or null status reads as default.
    pub fn status<T: DeserializeOwned + Default>(&self) -> Result<T, ObjectError> {
        match self.raw.get("status") {
            None | Some(Json::Null) => Ok(T::default()),
            Some(s) => T::deserialize(s).map_err(|e| ObjectError::MalformedStatus(e.to_string())),
        }
    }
}

/// The fields of a subscription's status the installer reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    #[serde(rename = "installedCSV", default)]
    pub installed_csv: Option<String>,
    #[serde(rename = "currentCSV", default)]
    pub current_csv: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

impl SubscriptionStatus {
    /// Reference to the resolved-version record, once the controller has populated it.
    pub fn resolved(&self) -> Option<&str> {
        self.installed_csv.as_deref().filter(|s| !s.is_empty())
    }
}

/// Lifecycle status of a resolved-version record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStatus {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl RecordStatus {
    pub fn phase(&self) -> Option<&str> {
        self.phase.as_deref().filter(|s| !s.is_empty())
    }
}
