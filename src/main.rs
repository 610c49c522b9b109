//! OnionWatch - onion service availability monitor.

use onionwatch::activity::ActivityLog;
use onionwatch::config::MonitorConfig;
use onionwatch::db::Store;
use onionwatch::probe::{shared_rng, HttpTransport, ProbeExecutor, ProbeSettings};
use onionwatch::registry::Registry;
use onionwatch::scheduler::{SweepOrchestrator, SweepScheduler};
use onionwatch::seed::{default_seeds, load_seed_file};
use onionwatch::web::{AppState, Server};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("onionwatch=info".parse()?))
        .init();

    let cfg = MonitorConfig::load();
    tracing::info!("Starting OnionWatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);
    tracing::info!("Probing through {}", cfg.proxy_url);

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let seeds = match &cfg.seed_file {
        Some(path) => load_seed_file(path)?,
        None => default_seeds(),
    };
    let registry = Arc::new(Registry::new(store.clone(), seeds));
    let merged = registry.ensure_seed_data()?;
    tracing::info!("Seed data ready ({} changes)", merged);

    let rng = shared_rng();
    let transport = Arc::new(HttpTransport::new(&cfg.proxy_url)?);
    let executor = Arc::new(ProbeExecutor::new(transport, ProbeSettings::default(), rng.clone()));
    let activity = Arc::new(ActivityLog::default());
    let orchestrator = Arc::new(SweepOrchestrator::new(
        store,
        executor,
        activity.clone(),
        cfg.max_concurrent_probes,
        rng,
    ));

    let shutdown = CancellationToken::new();
    let sweeps = SweepScheduler::new(orchestrator.clone(), cfg.sweep_interval).start(shutdown.clone());

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Shutdown requested");
        signal_token.cancel();
    });

    let server = Server::new(AppState {
        config: cfg,
        registry,
        orchestrator,
        activity,
        shutdown: shutdown.clone(),
    });
    let served = server.start().await;

    // A server error also stops the sweeps.
    shutdown.cancel();
    if let Some(handle) = sweeps {
        if let Err(e) = handle.await {
            tracing::error!("Sweep scheduler task failed: {}", e);
        }
    }

    served
}
