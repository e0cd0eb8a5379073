use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use olm_core::{
    request::{DEFAULT_NAMESPACE, DEFAULT_SOURCE, DEFAULT_SOURCE_NAMESPACE},
    ApprovalMode, InstallRequest, Object, SubscriptionStatus,
};
use olm_installer::{CancellationToken, InstallError, Installer, StatusView, WaitConfig};
use olm_kubehub::{ConnectOptions, GatewayConfig, KubeGateway};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};

/// Exit status of `status` when the operator is not installed.
const EXIT_NOT_INSTALLED: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "olmctl", version, about = "Install and inspect operators through subscriptions")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    connect: ConnectArgs,

    #[command(flatten)]
    wait: WaitArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Path to a kubeconfig file
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,
    /// Raw kubeconfig contents
    #[arg(long = "kubeconfig-raw", global = true, env = "OLMCTL_KUBECONFIG_RAW", hide_env_values = true)]
    kubeconfig_raw: Option<String>,
    /// Kubeconfig context to use
    #[arg(long, global = true)]
    context: Option<String>,
    /// API server URL; used with the certificate flags when no kubeconfig is given
    #[arg(long, global = true, env = "OLMCTL_HOST")]
    host: Option<String>,
    /// Cluster CA certificate (PEM or base64)
    #[arg(long = "ca-certificate", global = true, env = "OLMCTL_CA_CERTIFICATE", hide_env_values = true)]
    ca_certificate: Option<String>,
    /// Client certificate (PEM or base64)
    #[arg(long = "client-certificate", global = true, env = "OLMCTL_CLIENT_CERTIFICATE", hide_env_values = true)]
    client_certificate: Option<String>,
    /// Client key (PEM or base64)
    #[arg(long = "client-key", global = true, env = "OLMCTL_CLIENT_KEY", hide_env_values = true)]
    client_key: Option<String>,
}

impl From<ConnectArgs> for ConnectOptions {
    fn from(a: ConnectArgs) -> Self {
        ConnectOptions {
            kubeconfig: a.kubeconfig,
            kubeconfig_raw: a.kubeconfig_raw,
            context: a.context,
            host: a.host,
            ca_certificate: a.ca_certificate,
            client_certificate: a.client_certificate,
            client_key: a.client_key,
        }
    }
}

#[derive(Args, Debug)]
struct WaitArgs {
    /// Delay between status polls
    #[arg(long = "poll-interval-ms", global = true)]
    poll_interval_ms: Option<u64>,
    /// Bound on waiting for the subscription to resolve a version
    #[arg(long = "resolution-timeout-secs", global = true)]
    resolution_timeout_secs: Option<u64>,
    /// Bound on waiting for the resolved version to succeed
    #[arg(long = "convergence-timeout-secs", global = true)]
    convergence_timeout_secs: Option<u64>,
}

impl WaitArgs {
    fn config(&self) -> WaitConfig {
        let mut cfg = WaitConfig::from_env();
        if let Some(ms) = self.poll_interval_ms {
            cfg.poll_interval = Duration::from_millis(ms);
        }
        if let Some(s) = self.resolution_timeout_secs {
            cfg.resolution_timeout = Duration::from_secs(s);
        }
        if let Some(s) = self.convergence_timeout_secs {
            cfg.convergence_timeout = Duration::from_secs(s);
        }
        cfg
    }
}

#[derive(Args, Debug, Clone)]
struct RequestArgs {
    /// Operator package name; also the subscription name
    name: String,
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,
    #[arg(long, default_value = "stable")]
    channel: String,
    /// Catalog source providing the package
    #[arg(long, default_value = DEFAULT_SOURCE)]
    source: String,
    #[arg(long = "source-namespace", default_value = DEFAULT_SOURCE_NAMESPACE)]
    source_namespace: String,
    /// Install plan approval: Automatic or Manual
    #[arg(long, default_value = "Automatic")]
    approval: ApprovalMode,
}

impl RequestArgs {
    fn request(&self) -> InstallRequest {
        InstallRequest::new(&self.name, &self.channel)
            .namespace(&self.namespace)
            .source(&self.source, &self.source_namespace)
            .approval(self.approval)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Subscribe to an operator and wait until its version succeeds
    Install(RequestArgs),
    /// Check that an operator is still installed and healthy
    Status(RequestArgs),
    /// Remove the subscription and its installed version
    Uninstall(RequestArgs),
    /// Move an install from one channel to another
    Update {
        /// Channel the operator is currently installed from
        #[arg(long = "from-channel")]
        from_channel: String,
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Print the objects an install would create, without contacting the cluster
    Manifest(RequestArgs),
    /// List subscriptions with their resolved version and state
    Ls {
        /// Namespace to list (default: operators)
        #[arg(long, default_value = DEFAULT_NAMESPACE)]
        namespace: String,
        /// List across all namespaces
        #[arg(short = 'A', long = "all-namespaces")]
        all_namespaces: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("OLMCTL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("OLMCTL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid OLMCTL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; cancelling");
            token.cancel();
        }
    });
}

async fn installer(connect: ConnectArgs, wait: &WaitArgs) -> Result<Installer> {
    let opts: ConnectOptions = connect.into();
    let client = olm_kubehub::connect(&opts).await?;
    let gateway = KubeGateway::with_config(client, GatewayConfig::from_env());
    Ok(Installer::new(Arc::new(gateway), wait.config()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    match cli.command {
        Commands::Manifest(args) => {
            let req = args.request();
            req.validate()?;
            print_manifest(&Installer::build_manifest(&req), cli.output)?;
        }
        Commands::Install(args) => {
            let req = args.request();
            let inst = installer(cli.connect, &cli.wait).await?;
            cancel_on_ctrl_c(cancel.clone());
            info!(operator = %req.name, namespace = %req.namespace, "install invoked");
            let view = inst.install(&req, &cancel).await?;
            print_view(&view, cli.output)?;
        }
        Commands::Status(args) => {
            let req = args.request();
            let inst = installer(cli.connect, &cli.wait).await?;
            cancel_on_ctrl_c(cancel.clone());
            match inst.read_status(&req, &cancel).await {
                Ok(view) => print_view(&view, cli.output)?,
                Err(e @ InstallError::NotInstalled { .. }) => {
                    match cli.output {
                        Output::Human => println!("{e}"),
                        Output::Json => println!("{}", serde_json::json!({"verdict": "not_installed", "message": e.to_string()})),
                    }
                    std::process::exit(EXIT_NOT_INSTALLED);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Uninstall(args) => {
            let req = args.request();
            let inst = installer(cli.connect, &cli.wait).await?;
            cancel_on_ctrl_c(cancel.clone());
            inst.uninstall(&req, &cancel).await?;
            match cli.output {
                Output::Human => println!("uninstalled {}/{}", req.namespace, req.name),
                Output::Json => println!("{}", serde_json::json!({"uninstalled": {"namespace": req.namespace, "name": req.name}})),
            }
        }
        Commands::Update { from_channel, request } => {
            let desired = request.request();
            let previous = RequestArgs { channel: from_channel, ..request }.request();
            let inst = installer(cli.connect, &cli.wait).await?;
            cancel_on_ctrl_c(cancel.clone());
            let view = inst.update(&previous, &desired, &cancel).await?;
            print_view(&view, cli.output)?;
        }
        Commands::Ls { namespace, all_namespaces } => {
            let ns = if all_namespaces { "" } else { namespace.as_str() };
            let inst = installer(cli.connect, &cli.wait).await?;
            cancel_on_ctrl_c(cancel.clone());
            let subs = inst.list(ns, &cancel).await.context("listing subscriptions")?;
            print_subscriptions(&subs, cli.output)?;
        }
    }
    Ok(())
}

fn print_manifest(objects: &[Object], output: Output) -> Result<()> {
    match output {
        Output::Json => {
            let raw: Vec<_> = objects.iter().map(Object::raw).collect();
            println!("{}", serde_json::to_string_pretty(&raw)?);
        }
        Output::Human => {
            for obj in objects {
                print!("---\n{}", serde_yaml::to_string(obj.raw())?);
            }
        }
    }
    Ok(())
}

fn print_view(view: &StatusView, output: Output) -> Result<()> {
    let summary = view.summary();
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        Output::Human => {
            println!("verdict: {:?}", summary.verdict);
            for o in &summary.objects {
                let extra = o.detail.as_deref().or(o.error.as_deref()).unwrap_or("");
                println!("{} • {}/{} • {} {}", o.gvk, o.namespace, o.name, o.state, extra);
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct SubscriptionRow<'a> {
    namespace: &'a str,
    name: &'a str,
    channel: Option<&'a str>,
    installed: Option<String>,
    state: Option<String>,
}

fn print_subscriptions(subs: &[Object], output: Output) -> Result<()> {
    let rows: Vec<_> = subs
        .iter()
        .map(|s| {
            let status: SubscriptionStatus = s.status().unwrap_or_default();
            SubscriptionRow {
                namespace: &s.key().namespace,
                name: &s.key().name,
                channel: s.raw().pointer("/spec/channel").and_then(|v| v.as_str()),
                installed: status.resolved().map(str::to_string),
                state: status.state,
            }
        })
        .collect();
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        Output::Human => {
            for r in rows {
                println!(
                    "{}/{} • {} • {} • {}",
                    r.namespace,
                    r.name,
                    r.channel.unwrap_or("-"),
                    r.installed.as_deref().unwrap_or("<unresolved>"),
                    r.state.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}
