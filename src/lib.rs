// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! MetroGym presence: automatic gym check-in and live occupancy
//!
//! This crate provides the backend that matches member device positions to
//! gyms, keeps each member's presence record current, and serves live
//! per-gym visitor counts.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use config::Config;
use db::DocumentStore;
use services::{GymDirectory, OccupancyAggregator, OccupancyScope, PresenceSessions};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn DocumentStore>,
    pub gyms: GymDirectory,
    /// All-gyms occupancy, shared by every request
    pub occupancy: OccupancyAggregator,
    pub sessions: PresenceSessions,
    idle_sweeper: JoinHandle<()>,
}

impl AppState {
    /// Subscribe to the store and build the shared services.
    ///
    /// Must run inside a Tokio runtime.
    pub fn new(config: Config, store: Arc<dyn DocumentStore>) -> Self {
        let gyms = GymDirectory::subscribe(store.as_ref());
        let occupancy = OccupancyAggregator::start(
            store.as_ref(),
            OccupancyScope::AllGyms,
            config.occupancy_policy(),
        );
        let sessions = PresenceSessions::new(
            store.clone(),
            gyms.clone(),
            config.presence_policy(),
            config.session_idle_timeout,
        );
        let idle_sweeper = sessions.spawn_idle_sweeper();

        Self {
            config,
            store,
            gyms,
            occupancy,
            sessions,
            idle_sweeper,
        }
    }

    /// End all presence sessions and release subscriptions.
    pub async fn shutdown(&self) {
        self.idle_sweeper.abort();
        self.sessions.end_all().await;
        self.occupancy.stop().await;
    }
}
