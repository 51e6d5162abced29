//! CNS Metadata Syncer
//!
//! Watches PersistentVolumes, PersistentVolumeClaims and Pods and keeps the
//! entity references of a volume backend in sync with them.

use clap::{Parser, ValueEnum};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::{Api, Client};
use prometheus::Registry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cns_metadata_syncer::domain::ports::{EntityReferenceStoreRef, VolumeQueryClientRef};
use cns_metadata_syncer::{
    CrdEntityStore, Error, InMemoryVolumeStore, Informer, KubeObjectCache, MetadataSyncer,
    Result, SyncMetrics, SyncerConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Backend holding the entity references
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Backend {
    /// CnsVolumeMetadata custom resources
    Crd,
    /// In-process store (dry run)
    Memory,
}

/// CNS Metadata Syncer - keeps volume entity references in sync with the cluster
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long, env = "SYNCER_CONFIG")]
    config: Option<PathBuf>,

    /// CSI driver name owned volumes must carry
    #[arg(long, env = "CSI_DRIVER_NAME")]
    driver_name: Option<String>,

    /// Cluster id prefixed to backend entity keys
    #[arg(long, env = "CLUSTER_ID")]
    cluster_id: Option<String>,

    /// Treat in-tree vSphere volumes as owned
    #[arg(long, env = "CSI_MIGRATION")]
    csi_migration: bool,

    /// Full sync interval in seconds
    #[arg(long, env = "FULL_SYNC_INTERVAL")]
    full_sync_interval_secs: Option<u64>,

    /// Number of incremental sync workers
    #[arg(long, env = "SYNC_WORKERS")]
    workers: Option<usize>,

    /// Entity reference backend
    #[arg(long, env = "SYNCER_BACKEND", value_enum, default_value = "crd")]
    backend: Backend,

    /// Namespace holding CnsVolumeMetadata objects
    #[arg(long, env = "BACKEND_NAMESPACE", default_value = "vmware-system-csi")]
    backend_namespace: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// File configuration with command-line overrides applied
    fn syncer_config(&self) -> Result<SyncerConfig> {
        let mut config = match &self.config {
            Some(path) => SyncerConfig::from_yaml_file(path)?,
            None => SyncerConfig::default(),
        };
        if let Some(driver_name) = &self.driver_name {
            config.driver_name = driver_name.clone();
        }
        if let Some(cluster_id) = &self.cluster_id {
            config.cluster_id = cluster_id.clone();
        }
        if self.csi_migration {
            config.csi_migration = true;
        }
        if let Some(interval) = self.full_sync_interval_secs {
            config.full_sync_interval_secs = interval;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;
    let config = args.syncer_config()?;

    info!("Starting CNS Metadata Syncer");
    info!("  Version: {}", cns_metadata_syncer::VERSION);
    info!("  Driver: {}", config.driver_name);
    info!("  Cluster ID: {:?}", config.cluster_id);
    info!("  CSI migration: {}", config.csi_migration);
    info!("  Backend: {:?}", args.backend);

    let client = Client::try_default().await?;
    let shutdown = CancellationToken::new();

    let pv_informer = Informer::<PersistentVolume>::new("PersistentVolume");
    let pvc_informer = Informer::<PersistentVolumeClaim>::new("PersistentVolumeClaim");
    let pod_informer = Informer::<Pod>::new("Pod");
    let cache = Arc::new(KubeObjectCache::new(
        pv_informer.reader(),
        pvc_informer.reader(),
        pod_informer.reader(),
    ));

    let (query, store): (VolumeQueryClientRef, EntityReferenceStoreRef) = match args.backend {
        Backend::Crd => {
            let backend = Arc::new(CrdEntityStore::new(client.clone(), &args.backend_namespace));
            (backend.clone(), backend)
        }
        Backend::Memory => {
            let backend = Arc::new(InMemoryVolumeStore::new());
            (backend.clone(), backend)
        }
    };

    let registry = Arc::new(Registry::new());
    let metrics = SyncMetrics::new(&registry)?;
    let syncer = MetadataSyncer::new(config, cache.clone(), query, store, metrics)?;

    tokio::spawn(pv_informer.run(Api::all(client.clone()), syncer.clone(), shutdown.clone()));
    tokio::spawn(pvc_informer.run(Api::all(client.clone()), syncer.clone(), shutdown.clone()));
    tokio::spawn(pod_informer.run(Api::all(client), syncer.clone(), shutdown.clone()));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_cache = cache.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_cache).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_registry = registry.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_registry).await {
            error!("Metrics server error: {}", e);
        }
    });

    info!("Waiting for informer caches to sync");
    tokio::select! {
        synced = cache.wait_until_ready() => {
            if !synced {
                return Err(Error::Internal("informers stopped before caches synced".into()));
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            shutdown.cancel();
            info!("Interrupted before caches synced");
            return Ok(());
        }
    }

    let runner = tokio::spawn(syncer.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown.cancel();
    runner
        .await
        .map_err(|e| Error::Internal(format!("syncer task failed: {}", e)))?;

    info!("Syncer shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        let directive = directive
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid log directive: {}", e)))?;
        filter = filter.add_directive(directive);
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, cache: Arc<KubeObjectCache>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let cache = cache.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = cache.is_ready();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "caches not synced"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, registry: Arc<Registry>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            let encoder = TextEncoder::new();
                            let mut buffer = Vec::new();
                            match encoder.encode(&registry.gather(), &mut buffer) {
                                Ok(()) => {
                                    let mut response = respond(StatusCode::OK, buffer);
                                    if let Ok(content_type) = encoder.format_type().parse() {
                                        response
                                            .headers_mut()
                                            .insert(hyper::header::CONTENT_TYPE, content_type);
                                    }
                                    response
                                }
                                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                            }
                        }
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
