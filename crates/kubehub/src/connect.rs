use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::Engine;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Cluster connection parameters handed over by the host.
///
/// Precedence: raw kubeconfig text, then a kubeconfig path, then an explicit
/// host with certificates, then whatever `KUBECONFIG` / in-cluster config provides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub kubeconfig: Option<PathBuf>,
    pub kubeconfig_raw: Option<String>,
    pub context: Option<String>,
    pub host: Option<String>,
    pub ca_certificate: Option<String>,
    pub client_certificate: Option<String>,
    pub client_key: Option<String>,
}

pub async fn connect(opts: &ConnectOptions) -> Result<Client> {
    let config = load_config(opts).await?;
    info!(url = %config.cluster_url, "connecting to cluster");
    Client::try_from(config).context("building kube client")
}

async fn load_config(opts: &ConnectOptions) -> Result<Config> {
    let kc_opts = KubeConfigOptions { context: opts.context.clone(), ..Default::default() };
    if let Some(raw) = opts.kubeconfig_raw.as_deref() {
        let kc = Kubeconfig::from_yaml(raw).context("parsing inline kubeconfig")?;
        return Config::from_custom_kubeconfig(kc, &kc_opts).await.context("loading inline kubeconfig");
    }
    if let Some(path) = opts.kubeconfig.as_ref() {
        let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
        return Config::from_custom_kubeconfig(kc, &kc_opts).await.context("loading kubeconfig");
    }
    if opts.host.is_some() {
        let kc = host_kubeconfig(opts)?;
        return Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
            .await
            .context("loading host credentials");
    }
    Config::infer().await.context("inferring cluster config")
}

/// Single-context kubeconfig for an explicit host and optional client credentials.
fn host_kubeconfig(opts: &ConnectOptions) -> Result<Kubeconfig> {
    let host = opts.host.as_deref().context("host is required")?;
    let mut cluster = serde_json::json!({ "server": host });
    if let Some(ca) = opts.ca_certificate.as_deref() {
        cluster["certificate-authority-data"] = serde_json::Value::String(as_base64(ca));
    }
    let mut user = serde_json::json!({});
    if let Some(cert) = opts.client_certificate.as_deref() {
        user["client-certificate-data"] = serde_json::Value::String(as_base64(cert));
    }
    if let Some(key) = opts.client_key.as_deref() {
        user["client-key-data"] = serde_json::Value::String(as_base64(key));
    }
    let doc = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": "target", "cluster": cluster }],
        "users": [{ "name": "target", "user": user }],
        "contexts": [{ "name": "target", "context": { "cluster": "target", "user": "target" } }],
        "current-context": "target",
    });
    serde_json::from_value(doc).context("assembling kubeconfig from host credentials")
}

// Kubeconfig *-data fields are base64; accept PEM text as well.
fn as_base64(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.starts_with("-----BEGIN") {
        base64::engine::general_purpose::STANDARD.encode(trimmed.as_bytes())
    } else {
        trimmed.to_string()
    }
}
