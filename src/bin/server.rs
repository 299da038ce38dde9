//! Entitlement Engine Server
//!
//! Serves the entitlement HTTP API and runs the billing-period reset job
//! in the same process.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use entitlement_core::{
    create_router, spawn_reset_job, AppState, EngineConfig, InMemoryQuotaStore, QuotaService, QuotaStore,
    StoreBackend,
};

/// Entitlement Engine Server
#[derive(Parser, Debug)]
#[command(name = "entitlement-server")]
#[command(version)]
#[command(about = "Subscription entitlement and quota enforcement server")]
struct Args {
    /// Config file (TOML or YAML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// HTTP API bind address (overrides the config file)
    #[arg(long)]
    http_bind: Option<String>,

    /// Disable the periodic reset job
    #[arg(long)]
    no_reset_job: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to install tracing subscriber")?;

    let mut config = EngineConfig::load_or_default(args.config.as_deref()).context("Failed to load engine config")?;
    if let Some(bind) = args.http_bind {
        config.server.http_bind = bind;
    }

    info!("🚀 Entitlement Engine v{}", entitlement_core::VERSION);
    info!("   HTTP API:   {}", config.server.http_bind);
    info!("   Store:      {:?}", config.store.backend);
    info!("   Reset job:  {}", if config.reset.enabled && !args.no_reset_job { "enabled" } else { "disabled" });

    let store = build_store(&config).await?;
    let service = QuotaService::new(store, config.tiers.clone()).with_store_timeout(config.store.timeout());

    let reset_job = if config.reset.enabled && !args.no_reset_job {
        Some(spawn_reset_job(config.reset.job_config(), service.clone()))
    } else {
        None
    };

    let http_addr: SocketAddr = config
        .server
        .http_bind
        .parse()
        .with_context(|| format!("Invalid HTTP bind address {}", config.server.http_bind))?;
    let app = create_router(Arc::new(AppState::new(service)));
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", http_addr))?;

    info!("🌐 HTTP server listening on {}", http_addr);

    let http_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    // Wait for shutdown signal
    tokio::select! {
        result = http_handle => match result {
            Ok(Ok(())) => info!("HTTP server stopped"),
            Ok(Err(e)) => tracing::error!("HTTP server error: {}", e),
            Err(e) => tracing::error!("HTTP server task failed: {}", e),
        },
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
    }

    if let Some((shutdown, handle)) = reset_job {
        let _ = shutdown.send(true);
        let _ = handle.await;
    }

    Ok(())
}

async fn build_store(config: &EngineConfig) -> Result<Arc<dyn QuotaStore>> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryQuotaStore::new())),
        StoreBackend::Postgres => connect_postgres(config).await,
    }
}

#[cfg(feature = "postgres")]
async fn connect_postgres(config: &EngineConfig) -> Result<Arc<dyn QuotaStore>> {
    let url = config
        .store
        .database_url
        .as_deref()
        .context("database_url is required for the postgres backend")?;
    let store = entitlement_core::PostgresQuotaStore::connect(url, config.store.max_connections)
        .await
        .context("Failed to connect to PostgreSQL")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn connect_postgres(_config: &EngineConfig) -> Result<Arc<dyn QuotaStore>> {
    anyhow::bail!("postgres backend requested but this binary was built without the `postgres` feature")
}
