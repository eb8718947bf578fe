//! routegate — API gateway binary.
//!
//! Startup sequencing: observability first, then the stores, then the
//! route cache (a failed warm-up aborts startup — serving traffic with an
//! empty snapshot would 404 every request), then the background tasks,
//! and only then the listener.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use routegate::access_log::{self, KafkaAccessLogPublisher};
use routegate::config::GatewayConfig;
use routegate::event_stream::SseRegistry;
use routegate::proxy_service;
use routegate::rate_limiter::RedisRateLimiter;
use routegate::route_cache::RouteCache;
use routegate::route_store::{PgRouteStore, RouteStore};
use routegate::server::{self, AppState};

/// Command-line options. Everything else is environment-driven; see
/// [`GatewayConfig::from_env`].
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, env = "ROUTEGATE_PORT", default_value = "8080")]
    port: u16,

    /// Bind address
    #[arg(short, long, env = "ROUTEGATE_BIND", default_value = "0.0.0.0")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Phase 1: observability.
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = GatewayConfig::from_env();

    // Phase 2: durable stores.
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;
    let store = Arc::new(PgRouteStore::new(pool));
    store.ensure_schema().await?;
    let store: Arc<dyn RouteStore> = store;

    let limiter = Arc::new(
        RedisRateLimiter::connect(&config.redis_url, config.rate_limit_timeout).await?,
    );

    let publisher = Arc::new(KafkaAccessLogPublisher::new(&config)?);

    // Phase 3: warm the route cache. Failure here is fatal.
    let cache = Arc::new(RouteCache::new(Arc::clone(&store)));
    cache.refresh().await.map_err(|e| {
        error!(error = %e, "startup route cache refresh failed");
        e
    })?;
    info!(routes = cache.len(), "route cache warmed");

    // Phase 4: background tasks.
    let shutdown = CancellationToken::new();
    cache.spawn_refresh_task(config.cache_refresh_interval, shutdown.clone());

    let registry = Arc::new(SseRegistry::new());
    access_log::spawn_consumer(&config, Arc::clone(&registry), shutdown.clone())?;

    // Phase 5: serve.
    let client = proxy_service::build_client(config.pool_max_idle_per_host)?;
    let state = AppState {
        store,
        cache,
        limiter,
        sink: publisher,
        registry,
        client,
        upstream_timeout: config.upstream_timeout,
    };
    let app = server::router(state);

    let addr = format!("{}:{}", cli.bind, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        addr = %addr,
        kafka = %config.kafka_brokers,
        topic = %config.access_log_topic,
        refresh_secs = config.cache_refresh_interval.as_secs(),
        "routegate listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await?;

    info!("routegate stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM and cancel the background tasks.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }

    shutdown.cancel();
}
