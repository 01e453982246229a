use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use kopa_configmap::{ConfigMapSync, KubeStatusWriter, MatcherConfig};
use kopa_core::{BackoffPolicy, ResourceDescriptor};
use kopa_dynamic::DynamicSync;
use kopa_kubehub::{discover_resources, KubeWatchSource};
use kopa_opa::{Data, HttpClient};
use kopa_policy::{PolicySink, PolicyStore};
use kopa_sync::{GenericSync, WatchSource};

#[derive(Parser, Debug)]
#[command(name = "kopa", version, about = "Replicates Kubernetes resources and policies into OPA")]
struct Cli {
    /// URL of the OPA API endpoint
    #[arg(long = "opa-url", default_value = "http://localhost:8181/v1", env = "KOPA_OPA_URL")]
    opa_url: String,

    /// Bearer token for the OPA API endpoint
    #[arg(long = "opa-auth-token")]
    opa_auth_token: Option<String>,

    /// File containing the bearer token (first line)
    #[arg(long = "opa-auth-token-file")]
    opa_auth_token_file: Option<PathBuf>,

    /// Replicate namespaced resources, e.g. "v1/pods" or
    /// "apps/v1/deployments" (repeatable)
    #[arg(long = "replicate")]
    replicate: Vec<String>,

    /// Replicate cluster-level resources, e.g. "v1/nodes" (repeatable)
    #[arg(long = "replicate-cluster")]
    replicate_cluster: Vec<String>,

    /// Path to replicate data into
    #[arg(long = "replicate-path", default_value = "kubernetes")]
    replicate_path: String,

    /// Namespaces excluded from resource replication
    #[arg(long = "ignore-namespaces", value_delimiter = ',')]
    ignore_namespaces: Vec<String>,

    /// Discover policies from ConfigMaps
    #[arg(long = "enable-policies", default_value_t = true, action = ArgAction::Set)]
    enable_policies: bool,

    /// Discover data from labelled ConfigMaps
    #[arg(long = "enable-data", default_value_t = false, action = ArgAction::Set)]
    enable_data: bool,

    /// Namespaces to load policies and data from ("*" for all)
    #[arg(long = "policies", value_delimiter = ',', default_value = "opa")]
    policies: Vec<String>,

    /// Only load policies out of labelled ConfigMaps
    #[arg(long = "require-policy-label")]
    require_policy_label: bool,

    /// Label key marking policy ConfigMaps
    #[arg(long = "policy-label", default_value = "kopa.dev/policy")]
    policy_label: String,

    /// Label value marking policy ConfigMaps
    #[arg(long = "policy-value", default_value = "rego")]
    policy_value: String,

    /// Label key marking data ConfigMaps
    #[arg(long = "data-label", default_value = "kopa.dev/data")]
    data_label: String,

    /// Label value marking data ConfigMaps
    #[arg(long = "data-value", default_value = "json")]
    data_value: String,

    /// Entrypoint rule for dependency-driven replication, e.g.
    /// "system/main"; resource kinds its rule graph references under the
    /// replicate path are replicated automatically
    #[arg(long = "analysis-entrypoint")]
    analysis_entrypoint: Option<String>,

    /// Minimum delay before a failed sync reloads
    #[arg(long = "sync-backoff-min-secs", default_value_t = 1)]
    sync_backoff_min_secs: u64,

    /// Cap on the sync reload backoff
    #[arg(long = "sync-backoff-max-secs", default_value_t = 30)]
    sync_backoff_max_secs: u64,

    /// Fractional jitter applied to backoff delays
    #[arg(long = "sync-backoff-jitter", default_value_t = 0.1)]
    sync_backoff_jitter: f64,

    /// Serve Prometheus metrics on this address
    #[arg(long = "metrics-addr")]
    metrics_addr: Option<std::net::SocketAddr>,
}

fn init_tracing() {
    let env = std::env::var("KOPA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    if cli.opa_auth_token.is_some() && cli.opa_auth_token_file.is_some() {
        bail!("--opa-auth-token and --opa-auth-token-file are mutually exclusive");
    }
    let auth_token = match &cli.opa_auth_token_file {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Some(contents.lines().next().unwrap_or("").to_string())
        }
        None => cli.opa_auth_token.clone(),
    };

    if let Some(addr) = cli.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing metrics exporter")?;
        info!(addr = %addr, "metrics exporter listening");
    }

    let backoff = BackoffPolicy {
        min: Duration::from_secs(cli.sync_backoff_min_secs),
        max: Duration::from_secs(cli.sync_backoff_max_secs),
        jitter: cli.sync_backoff_jitter,
    };

    let opa = HttpClient::new(&cli.opa_url, auth_token.as_deref());
    let client = kube::Client::try_default()
        .await
        .context("loading Kubernetes client")?;
    let root = CancellationToken::new();
    let store = PolicyStore::new();
    let mut tasks = Vec::new();

    if cli.enable_policies || cli.enable_data {
        let matcher = MatcherConfig {
            namespaces: cli.policies.clone(),
            enable_policies: cli.enable_policies,
            enable_data: cli.enable_data,
            require_label: cli.require_policy_label,
            policy_label: (cli.policy_label.clone(), cli.policy_value.clone()),
            data_label: (cli.data_label.clone(), cli.data_value.clone()),
        };
        let mut sync = ConfigMapSync::new(
            Arc::new(opa.clone()),
            Arc::new(KubeStatusWriter::new(client.clone())),
            matcher,
            backoff,
        );
        if cli.analysis_entrypoint.is_some() {
            sync = sync.with_policy_sink(Arc::clone(&store) as Arc<dyn PolicySink>);
        }
        let sync = Arc::new(sync);
        let sync_client = client.clone();
        let token = root.child_token();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = sync.run(sync_client, token).await {
                error!(error = %err, "configmap sync failed");
            }
        }));
    }

    let source = Arc::new(KubeWatchSource::new(client.clone()));
    let writer = Data::prefix(&opa, &cli.replicate_path);

    let mut static_descriptors = Vec::new();
    for key in &cli.replicate {
        static_descriptors.push(ResourceDescriptor::parse(key, true)?);
    }
    for key in &cli.replicate_cluster {
        static_descriptors.push(ResourceDescriptor::parse(key, false)?);
    }
    for descriptor in static_descriptors {
        let engine = GenericSync::new(
            descriptor.clone(),
            &*writer,
            backoff,
            cli.ignore_namespaces.clone(),
        );
        let source = Arc::clone(&source);
        let token = root.child_token();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = engine.run(&*source, token).await {
                error!(resource = %descriptor, error = %err, "replication failed to start");
            }
        }));
    }

    if let Some(entrypoint) = &cli.analysis_entrypoint {
        let resources = discover_resources(client.clone())
            .await
            .context("resource discovery")?;
        let dynamic = Arc::new(DynamicSync::new(
            Data::prefix(&opa, &cli.replicate_path),
            Arc::clone(&source) as Arc<dyn WatchSource>,
            resources,
            entrypoint,
            &cli.replicate_path,
            cli.ignore_namespaces.clone(),
            backoff,
        ));
        let updates = store.subscribe();
        let token = root.child_token();
        tasks.push(tokio::spawn(async move {
            dynamic.run(updates, token).await;
        }));
    }

    info!("kopa started");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received; draining");
    root.cancel();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
