use anyhow::{Context, Result};
use common::{Bind, Frontend};
use control::apis::{metrics, watcher};
use control::config::ControllerConfig;
use control::controller::https::Https;
use control::controller::Controller;
use control::proxy::certs::SecretCertificates;
use control::proxy::memory::MemoryConfigApi;
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn load_config() -> Result<ControllerConfig> {
    let mut config = match env::var("TOLLGATE_CONFIG_FILE") {
        Ok(path) => ControllerConfig::from_file(Path::new(&path))
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path, e))?,
        Err(_) => ControllerConfig::default(),
    };
    config
        .apply_env()
        .map_err(|e| anyhow::anyhow!("Invalid environment configuration: {}", e))?;
    Ok(config)
}

/// In-memory proxy configuration with the frontends a proxy deployment ships
fn dry_run_api(config: &ControllerConfig) -> MemoryConfigApi {
    let api = MemoryConfigApi::new();
    let http_binds = vec![
        Bind {
            name: "v4".to_string(),
            address: config.https.addr_ipv4.clone(),
            port: Some(80),
            ..Default::default()
        },
        Bind {
            name: "v6".to_string(),
            address: config.https.addr_ipv6.clone(),
            port: Some(80),
            v4v6: true,
            ..Default::default()
        },
    ];
    api.seed_frontend(
        Frontend {
            name: config.frontends.http.clone(),
            ..Default::default()
        },
        http_binds,
    );
    api.seed_frontend(
        Frontend {
            name: config.frontends.https.clone(),
            ..Default::default()
        },
        Https::new(&config.https, &config.env.cert_dir).bind_list(false),
    );
    api.seed_frontend(
        Frontend {
            name: config.frontends.stats.clone(),
            ..Default::default()
        },
        vec![],
    );
    api
}

/// Tollgate control plane
///
/// Watches ingress resources and reconciles the proxy configuration.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (needed for Kubernetes TLS client)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    info!(
        ingress_class = %config.ingress_class,
        configmap = %config.configmap,
        namespace = config.watch_namespace.as_deref().unwrap_or("<all>"),
        "Starting tollgate ingress controller"
    );

    let metrics_addr: SocketAddr = config
        .metrics_addr
        .parse()
        .with_context(|| format!("Invalid metrics address '{}'", config.metrics_addr))?;
    let metrics_handle = tokio::spawn(async move {
        if let Err(e) = metrics::serve_metrics(metrics_addr).await {
            error!("Metrics endpoint error: {}", e);
        }
    });

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    warn!("No proxy configuration API configured, reconciling against an in-memory configuration");
    let api = Arc::new(dry_run_api(&config));
    let certificates = Box::new(SecretCertificates::new(&config.env.cert_dir));

    let (tx, rx) = watcher::channel();
    let watcher_handles = watcher::spawn_watchers(&client, &config, &tx);
    drop(tx);

    let controller = Controller::new(config, api, certificates);

    tokio::select! {
        _ = watcher::run(controller, rx) => {
            warn!("Reconciliation loop stopped");
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    for handle in watcher_handles {
        handle.abort();
    }
    metrics_handle.abort();

    Ok(())
}
