// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Presence routes: manual check-in, device samples, session lifecycle.

use crate::error::Result;
use crate::middleware::auth::AuthUser;
use crate::models::PresenceRecord;
use crate::routes::DeviceSample;
use crate::services::location::ReportedPosition;
use crate::services::{CheckIn, LocationProvider, PresenceState};
use crate::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{delete, get, post, put},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/presence", get(get_presence))
        .route("/api/presence/check-in", post(check_in))
        .route("/api/presence/check-out", post(check_out))
        .route("/api/presence/samples", post(report_sample))
        .route("/api/presence/session", delete(end_session))
        .route("/api/me/auto-presence", put(set_auto_presence))
}

// ─── Status ──────────────────────────────────────────────────

#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct PresenceResponse {
    pub state: PresenceState,
    pub auto_presence_enabled: bool,
    #[cfg_attr(feature = "binding-generation", ts(skip))]
    pub record: Option<PresenceRecord>,
}

/// Controller state plus the stored record.
async fn get_presence(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<PresenceResponse>> {
    let session = state.sessions.get_or_start(&user.user_id).await;
    let record = state.store.get_presence(&user.user_id).await?;
    let auto_presence_enabled = state.store.get_auto_presence_enabled(&user.user_id).await?;

    Ok(Json(PresenceResponse {
        state: session.controller.status(),
        auto_presence_enabled,
        record,
    }))
}

// ─── Manual mode ─────────────────────────────────────────────

/// Manual check-in from one device reading.
async fn check_in(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<DeviceSample>,
) -> Result<Json<CheckIn>> {
    let sample = body.into_sample()?;
    let session = state.sessions.get_or_start(&user.user_id).await;
    let check_in = session
        .controller
        .manual_check_in(&ReportedPosition(sample))
        .await?;
    Ok(Json(check_in))
}

#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct CheckOutResponse {
    /// False when nothing was checked in
    pub checked_out: bool,
}

async fn check_out(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<CheckOutResponse>> {
    let session = state.sessions.get_or_start(&user.user_id).await;
    let checked_out = session.controller.check_out().await?;
    Ok(Json(CheckOutResponse { checked_out }))
}

// ─── Continuous mode ─────────────────────────────────────────

#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct SampleAccepted {
    /// State before the sample is applied
    pub state: PresenceState,
}

/// Continuous-mode device reading. Applied asynchronously.
async fn report_sample(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<DeviceSample>,
) -> Result<(StatusCode, Json<SampleAccepted>)> {
    let sample = body.into_sample()?;
    let session = state.sessions.get_or_start(&user.user_id).await;
    session.report(sample).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SampleAccepted {
            state: session.controller.status(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct AutoPresenceRequest {
    pub enabled: bool,
}

#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct AutoPresenceResponse {
    pub enabled: bool,
    pub state: PresenceState,
}

/// Toggle auto-presence on the member profile.
async fn set_auto_presence(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<AutoPresenceRequest>,
) -> Result<Json<AutoPresenceResponse>> {
    let session = state.sessions.get_or_start(&user.user_id).await;
    session
        .controller
        .set_auto_presence(body.enabled, Some(&session.device as &dyn LocationProvider))
        .await?;

    tracing::info!(user_id = %user.user_id, enabled = body.enabled, "Auto-presence updated");
    Ok(Json(AutoPresenceResponse {
        enabled: body.enabled,
        state: session.controller.status(),
    }))
}

// ─── Session ─────────────────────────────────────────────────

#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct EndSessionResponse {
    pub ended: bool,
}

/// End the member's presence session (sign-out, app closed).
async fn end_session(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Json<EndSessionResponse> {
    let ended = state.sessions.end(&user.user_id).await;
    Json(EndSessionResponse { ended })
}
