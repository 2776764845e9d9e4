//! # Windgrid Server Binary
//!
//! HTTP front-end of the tiling/orchestration engine: wires the remote
//! backend client, the building data provider and the cache into an
//! orchestrator and serves the API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::info;

use windgrid_node::api::{router, AppState};
use windgrid_node::backend::{BackendConfig, HttpBackend};
use windgrid_node::cache::{CacheConfig, ResultCache};
use windgrid_node::provider::{HttpProvider, ProviderConfig};
use windgrid_node::{EngineConfig, Orchestrator};

#[derive(Parser)]
#[command(name = "windgrid-node")]
#[command(about = "Tiling and orchestration engine for remote environmental simulations")]
#[command(version)]
struct Cli {
    /// Bind address
    #[arg(long, default_value = "0.0.0.0", env = "WINDGRID_BIND")]
    bind: String,

    /// HTTP API port
    #[arg(short, long, default_value = "8080", env = "WINDGRID_PORT")]
    port: u16,

    /// Base URL of the remote simulation backend
    #[arg(long, env = "SIMULATION_BACKEND_URL")]
    backend_url: String,

    /// Backend account name
    #[arg(long, env = "SIMULATION_BACKEND_USER")]
    backend_user: String,

    /// Backend account password
    #[arg(long, env = "SIMULATION_BACKEND_PASSWORD")]
    backend_password: String,

    /// Base URL of the building data provider
    #[arg(long, env = "BUILDING_PROVIDER_URL")]
    provider_url: String,

    /// Seconds between backend keep-alive pings
    #[arg(long, default_value = "300", env = "WINDGRID_KEEPALIVE_SECS")]
    keepalive_secs: u64,

    /// Disable the result cache (every request recomputes)
    #[arg(long, env = "WINDGRID_CACHE_DISABLED")]
    no_cache: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let engine_config = EngineConfig::default();
    engine_config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid engine configuration: {e}"))?;

    info!("starting {} {}", windgrid_node::NAME, windgrid_node::VERSION);
    info!("simulation backend: {}", cli.backend_url);
    info!("building provider: {}", cli.provider_url);

    let backend = Arc::new(HttpBackend::new(BackendConfig {
        base_url: cli.backend_url,
        username: cli.backend_user,
        password: cli.backend_password,
    }));
    let provider = Arc::new(HttpProvider::new(ProviderConfig {
        base_url: cli.provider_url,
        max_retries: engine_config.provider_max_retries,
        retry_backoff: engine_config.provider_retry_backoff,
    }));
    let cache = Arc::new(ResultCache::new(CacheConfig {
        enabled: !cli.no_cache,
        ..Default::default()
    }));

    let orchestrator = Arc::new(Orchestrator::new(backend, provider, cache, engine_config));
    orchestrator.spawn_keep_alive(Duration::from_secs(cli.keepalive_secs));
    orchestrator.spawn_retention();

    let app = router(AppState {
        orchestrator: orchestrator.clone(),
    });

    let addr = format!("{}:{}", cli.bind, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C or SIGTERM, whichever arrives first.
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
