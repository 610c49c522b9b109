//! Web server module: JSON admin and diagnostics routes.

mod handlers;

pub use handlers::*;

use crate::activity::ActivityLog;
use crate::config::MonitorConfig;
use crate::registry::Registry;
use crate::scheduler::SweepOrchestrator;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: MonitorConfig,
    pub registry: Arc<Registry>,
    pub orchestrator: Arc<SweepOrchestrator>,
    pub activity: Arc<ActivityLog>,
    /// Cancelled on shutdown; request-triggered checks run on child tokens.
    pub shutdown: CancellationToken,
}

pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route(
                "/api/targets",
                get(handlers::handle_get_targets).post(handlers::handle_create_target),
            )
            .route(
                "/api/targets/{id}",
                get(handlers::handle_get_target)
                    .put(handlers::handle_update_target)
                    .delete(handlers::handle_delete_target),
            )
            .route("/api/targets/{id}/check", post(handlers::handle_check_target))
            .route("/api/sweep", post(handlers::handle_sweep))
            .route("/api/top", get(handlers::handle_top))
            .route("/api/proofs/{id}", get(handlers::handle_get_proof))
            .route("/api/activity", get(handlers::handle_activity))
            .route("/go/{id}", get(handlers::handle_go))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(256 * 1024))
            .with_state(self.state.clone())
    }

    /// Serve until the shutdown token is cancelled.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let shutdown = self.state.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        tracing::info!("Web server stopped");
        Ok(())
    }
}
