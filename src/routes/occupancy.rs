// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Occupancy routes.
//!
//! Members may read their primary gym only; admins may read any gym and the
//! all-gyms overview.

use crate::error::{AppError, Result};
use crate::middleware::auth::AuthUser;
use crate::models::{Gym, User};
use crate::services::occupancy::{build_overview, GymOccupancy, OccupancyOverview};
use crate::services::{OccupancyAggregator, OccupancyScope, OccupancyView};
use crate::AppState;
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
    routing::get,
    Extension, Json, Router,
};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/occupancy", get(get_overview))
        .route("/api/occupancy/me", get(get_my_gym))
        .route("/api/occupancy/{gym_id}", get(get_gym))
        .route("/api/occupancy/{gym_id}/events", get(gym_events))
}

async fn load_user(state: &AppState, user_id: &str) -> Result<User> {
    state
        .store
        .get_user(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))
}

/// Resolve a gym the member is allowed to view.
fn viewable_gym(state: &AppState, user: &User, gym_id: &str) -> Result<Gym> {
    if !user.can_view_gym(gym_id) {
        return Err(AppError::Forbidden(format!(
            "Occupancy for {} is limited to its members",
            gym_id
        )));
    }
    state
        .gyms
        .find(gym_id)
        .ok_or_else(|| AppError::NotFound(format!("Gym {} not found", gym_id)))
}

fn gym_occupancy(gym: &Gym, count: u32) -> GymOccupancy {
    GymOccupancy {
        gym_id: gym.id.clone(),
        gym_name: gym.name.clone(),
        count,
        status: gym.crowd_thresholds.status(count),
    }
}

// ─── Member views ────────────────────────────────────────────

#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct MyGymResponse {
    /// `None` when no primary gym is set
    pub gym: Option<GymOccupancy>,
}

/// Occupancy of the member's primary gym.
async fn get_my_gym(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<MyGymResponse>> {
    let profile = load_user(&state, &user.user_id).await?;
    let Some(gym_id) = profile.primary_gym.as_deref() else {
        return Ok(Json(MyGymResponse { gym: None }));
    };

    let gym = viewable_gym(&state, &profile, gym_id)?;
    let count = state.occupancy.occupancy(&gym.id)?;
    Ok(Json(MyGymResponse {
        gym: Some(gym_occupancy(&gym, count)),
    }))
}

async fn get_gym(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(gym_id): Path<String>,
) -> Result<Json<GymOccupancy>> {
    let profile = load_user(&state, &user.user_id).await?;
    let gym = viewable_gym(&state, &profile, &gym_id)?;
    let count = state.occupancy.occupancy(&gym.id)?;
    Ok(Json(gym_occupancy(&gym, count)))
}

// ─── Admin overview ──────────────────────────────────────────

async fn get_overview(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<OccupancyOverview>> {
    let profile = load_user(&state, &user.user_id).await?;
    if !profile.is_admin() {
        return Err(AppError::Forbidden(
            "All-gyms occupancy requires admin".to_string(),
        ));
    }

    let counts = state.occupancy.occupancy_all()?;
    Ok(Json(build_overview(&counts, &state.gyms.gyms())))
}

// ─── Live events ─────────────────────────────────────────────

/// SSE stream for one gym. Owns its aggregator, so the store subscription
/// is released when the client disconnects.
pub struct OccupancyEvents {
    aggregator: OccupancyAggregator,
    events: BoxStream<'static, std::result::Result<Event, axum::Error>>,
}

impl OccupancyEvents {
    fn new(aggregator: OccupancyAggregator, gym: Gym) -> Self {
        let views = aggregator.watch();
        let events = stream::unfold((views, true), move |(mut views, first)| {
            let gym = gym.clone();
            async move {
                if !first {
                    views.changed().await.ok()?;
                }
                // Nothing to show until the first snapshot arrives
                loop {
                    let view = views.borrow_and_update().clone();
                    if view != OccupancyView::Loading {
                        return Some((view_event(&gym, &view), (views, false)));
                    }
                    views.changed().await.ok()?;
                }
            }
        })
        .boxed();

        Self { aggregator, events }
    }
}

fn view_event(gym: &Gym, view: &OccupancyView) -> std::result::Result<Event, axum::Error> {
    match view {
        OccupancyView::Loading => Ok(Event::default().comment("loading")),
        OccupancyView::Ready { counts, .. } => {
            let count = counts.get(&gym.id).copied().unwrap_or(0);
            Event::default()
                .event("occupancy")
                .json_data(gym_occupancy(gym, count))
        }
        OccupancyView::Unavailable { error } => {
            Ok(Event::default().event("unavailable").data(error.as_str()))
        }
    }
}

impl Stream for OccupancyEvents {
    type Item = std::result::Result<Event, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}

impl Drop for OccupancyEvents {
    fn drop(&mut self) {
        tracing::debug!(scope = ?self.aggregator.scope(), "Occupancy stream closed");
    }
}

async fn gym_events(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(gym_id): Path<String>,
) -> Result<Sse<KeepAliveStream<OccupancyEvents>>> {
    let profile = load_user(&state, &user.user_id).await?;
    let gym = viewable_gym(&state, &profile, &gym_id)?;

    let aggregator = OccupancyAggregator::start(
        state.store.as_ref(),
        OccupancyScope::Gym(gym.id.clone()),
        state.config.occupancy_policy(),
    );
    tracing::debug!(user_id = %user.user_id, gym_id = %gym.id, "Occupancy stream opened");

    Ok(Sse::new(OccupancyEvents::new(aggregator, gym)).keep_alive(KeepAlive::default()))
}
