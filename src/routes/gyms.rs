// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Gym list.

use crate::db::FeedState;
use crate::error::{AppError, Result};
use crate::models::Gym;
use crate::AppState;
use axum::{extract::State, routing::get, Json, Router};
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/gyms", get(list_gyms))
}

/// All gyms, ordered by name.
async fn list_gyms(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Gym>>> {
    match state.gyms.state() {
        FeedState::Ready(gyms) => Ok(Json(gyms)),
        FeedState::Loading => Err(AppError::Unavailable(
            "Gym list is still loading".to_string(),
        )),
        FeedState::Failed(error) => Err(AppError::Unavailable(error)),
    }
}
