//! Control API module.

mod handlers;

pub use handlers::*;

use crate::config::ProcessorConfig;
use crate::jobs::JobQueue;
use crate::scheduler::ProbeScheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ProcessorConfig,
    pub scheduler: Arc<ProbeScheduler>,
    pub jobs: Arc<JobQueue>,
}

/// HTTP server exposing the control operations.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: ProcessorConfig, scheduler: Arc<ProbeScheduler>, jobs: Arc<JobQueue>) -> Self {
        Self {
            state: AppState {
                config,
                scheduler,
                jobs,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Control API listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/init", post(handlers::handle_init))
        .route("/api/targets/{owner}", post(handlers::handle_stage_targets))
        .route("/api/cycles", post(handlers::handle_run_cycle))
        .route("/api/records", get(handlers::handle_get_records))
        .route("/api/alerts/flag", post(handlers::handle_set_alert_flag))
        .route("/api/alerts/sent", post(handlers::handle_set_alert_sent))
        .route("/api/alerts/{id}/reset", post(handlers::handle_reset_alert))
        .route("/api/records/{id}/samples/remove", post(handlers::handle_remove_samples))
        .route("/api/jobs", post(handlers::handle_submit_job))
        .route(
            "/api/jobs/{id}",
            get(handlers::handle_job_status).delete(handlers::handle_cancel_job),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .with_state(state)
}
