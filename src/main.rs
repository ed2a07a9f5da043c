mod cache;
mod config;
mod error;
mod health;
mod http;
mod metrics;
mod routing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cache::{CacheManager, Populator};
use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::routing::RouteEngine;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "tarcache", about = "Caching gateway for registry tarballs")]
struct Cli {
    /// Path to the YAML configuration file.  Built-in defaults are used when
    /// omitted.
    #[arg(short, long)]
    config: Option<String>,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    /// Client for populate fetches and health probes.  Follows redirects.
    pub http_client: reqwest::Client,
    /// Client the gateway proxies through.  Never follows redirects so the
    /// client sees the upstream's answer verbatim.
    pub proxy_client: reqwest::Client,
    pub cache_manager: CacheManager,
    pub populator: Populator,
    pub routes: RouteEngine,
}

impl AppState {
    /// Wire up clients, cache and populator for `config`.
    ///
    /// `populate_cancel` aborts running populates once fired; the populator
    /// fires it itself when its shutdown grace period runs out.
    pub fn new(config: Arc<Config>, populate_cancel: CancellationToken) -> Result<Self> {
        let metrics = MetricsRegistry::new();

        let http_client = reqwest::Client::builder()
            .user_agent(config.origin.user_agent.as_str())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        let proxy_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build proxy client")?;

        let cache_manager = CacheManager::new(&config.cache);

        let populator = Populator::new(
            http_client.clone(),
            &config.origin.base_url,
            cache_manager.clone(),
            config.populate.clone(),
            metrics.clone(),
            populate_cancel,
        );

        let routes = RouteEngine::new(
            &config,
            cache_manager.clone(),
            populator.clone(),
            metrics.clone(),
        );

        Ok(Self {
            config,
            metrics,
            http_client,
            proxy_client,
            cache_manager,
            populator,
            routes,
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP servers (axum)
// ---------------------------------------------------------------------------

async fn bind(name: &str, addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {name} listener on {addr}"))
}

async fn run_server(
    name: &'static str,
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let listen_addr = listener.local_addr().context("listener has no address")?;
    tracing::info!(server = name, %listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .with_context(|| format!("{name} server error"))
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => {
            let config = Config::default();
            config::validate_config(&config)?;
            config
        }
    };
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = ?cli.config, "starting tarcache");

    // ---- Ensure local cache directory exists ----
    tokio::fs::create_dir_all(&config.cache.path)
        .await
        .with_context(|| format!("failed to create cache dir: {}", config.cache.path))?;

    // ---- App state ----
    let state = Arc::new(AppState::new(Arc::clone(&config), CancellationToken::new())?);

    // ---- Listeners ----
    let gateway_listener = bind("gateway", &config.gateway.listen).await?;
    let cache_listener = bind("cache server", &config.cache_server.listen).await?;
    let admin_listener = bind("admin", &config.admin.listen).await?;

    tracing::info!(
        origin = %config.origin.base_url,
        cache_server = %config.cache_server.base_url,
        cache_dir = %config.cache.path,
        single_flight = config.populate.single_flight,
        atomic_publish = config.populate.atomic_publish,
        "routing configured"
    );

    // ---- Spawn services ----
    let shutdown = CancellationToken::new();

    let gateway_app = http::handler::create_router(Arc::clone(&state));
    let cache_app = http::cache_server::create_router(&state)?;
    let admin_app = http::admin::create_router(Arc::clone(&state));

    let servers = [
        ("gateway", gateway_listener, gateway_app),
        ("cache server", cache_listener, cache_app),
        ("admin", admin_listener, admin_app),
    ]
    .map(|(name, listener, app)| {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_server(name, listener, app, shutdown.clone()).await {
                tracing::error!(server = name, error = %format!("{e:#}"), "HTTP server failed");
                shutdown.cancel();
            }
        })
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    // ---- Await shutdown ----
    for server in servers {
        let _ = server.await;
    }

    // Servers have stopped accepting work; let background populates finish.
    state
        .populator
        .shutdown(Duration::from_secs(config.populate.shutdown_grace_secs))
        .await;

    tracing::info!(
        populates = state.populator.launched(),
        "tarcache shut down cleanly"
    );
    Ok(())
}
