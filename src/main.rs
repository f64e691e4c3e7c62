//! apimon - monitor execution engine.
//!
//! Probes HTTP endpoints on their configured cadence, records every check,
//! opens and resolves incidents, and notifies the owner's alert channels.

mod alerts;
mod config;
mod db;
mod incident;
mod probe;
mod scheduler;
mod web;

#[cfg(test)]
mod testutil;

use alerts::AlertDispatcher;
use config::ServerConfig;
use db::Store;
use incident::IncidentTracker;
use probe::CheckRunner;
use scheduler::Scheduler;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("apimon=info".parse()?))
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("Starting apimon on port {}...", cfg.http_port);
    tracing::info!("Default timeout: {}ms", cfg.probe.default_timeout_ms);
    tracing::info!("Failure threshold: {} consecutive checks", cfg.failure_threshold);
    tracing::info!("Region: {}", cfg.probe.region);
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let dispatcher = AlertDispatcher::new(store.clone(), cfg.alerts.clone(), cfg.failure_threshold)?;
    let incidents = Arc::new(IncidentTracker::new(
        store.clone(),
        dispatcher,
        cfg.failure_threshold,
    ));
    let runner = Arc::new(CheckRunner::new(store.clone(), incidents, cfg.probe.clone())?);
    let scheduler = Scheduler::new(store, runner, cfg.schedule.clone());

    scheduler.start().await?;

    let server = Server::new(cfg, scheduler.clone());
    let served = server.start(shutdown_signal()).await;

    scheduler.stop().await;
    tracing::info!("apimon shut down");

    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Received shutdown signal");
}
