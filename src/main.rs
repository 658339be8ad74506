// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! MetroGym presence API server
//!
//! Matches member device positions to gyms, keeps presence records current,
//! and serves live per-gym occupancy.

use metrogym_presence::{
    config::{Config, StoreBackend},
    db::{DocumentStore, FirestoreDb, MemoryStore},
    services::load_gyms_from_file,
    AppState,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured JSON logging for GCP
    init_logging();

    // Load configuration from environment
    let config = Config::from_env()?;
    tracing::info!(
        port = config.port,
        backend = ?config.store_backend,
        radius_meters = config.proximity_radius_meters,
        freshness_secs = config.freshness_window.as_secs(),
        "Starting MetroGym presence API"
    );

    let store: Arc<dyn DocumentStore> = match config.store_backend {
        StoreBackend::Firestore => {
            let db = FirestoreDb::new(&config.gcp_project_id)
                .await?
                .with_retry_delay(config.listen_retry_delay);
            tracing::info!(project = %config.gcp_project_id, "Firestore connected");

            if let Some(path) = &config.gym_seed_path {
                let gyms = load_gyms_from_file(path)?;
                for gym in &gyms {
                    db.upsert_gym(gym).await?;
                }
                tracing::info!(path = %path, count = gyms.len(), "Gym seed written to Firestore");
            }
            Arc::new(db)
        }
        StoreBackend::Memory => {
            let gyms = match &config.gym_seed_path {
                Some(path) => {
                    tracing::info!(path = %path, "Loading gym seed");
                    load_gyms_from_file(path)?
                }
                None => Vec::new(),
            };
            tracing::warn!(gyms = gyms.len(), "Using in-memory store; presence is not persisted");
            Arc::new(MemoryStore::with_gyms(gyms))
        }
    };

    // Build shared state
    let state = Arc::new(AppState::new(config.clone(), store));

    // Build router
    let app = metrogym_presence::routes::create_router(state.clone());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Initialize structured JSON logging (GCP-compliant).
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .add_directive(
                    "metrogym_presence=debug"
                        .parse()
                        .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::DEBUG.into()),
                ),
        )
        .with(format)
        .init();
}
