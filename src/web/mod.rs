//! Web server module: liveness and schedule inspection.

mod handlers;

use crate::config::ServerConfig;
use crate::scheduler::Scheduler;

use axum::{routing::get, Router};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub scheduler: Scheduler,
}

pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, scheduler: Scheduler) -> Self {
        Self {
            state: AppState { config, scheduler },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        Router::new()
            .route("/health", get(handlers::handle_health))
            .route("/api/schedule", get(handlers::handle_schedule))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
