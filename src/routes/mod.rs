// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! HTTP route handlers.

pub mod gyms;
pub mod occupancy;
pub mod presence;

use crate::error::{AppError, Result};
use crate::middleware::auth::require_auth;
use crate::models::Coordinates;
use crate::services::{LocationError, LocationSample};
use crate::AppState;
use axum::http::{header, Method};
use axum::{middleware, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;
use validator::Validate;

#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct HealthResponse {
    pub status: String,
    pub build_id: String,
}

/// Health check response
async fn health_check() -> Json<HealthResponse> {
    let build_id = option_env!("BUILD_ID").unwrap_or("unknown").to_string();
    Json(HealthResponse {
        status: "ok".to_string(),
        build_id,
    })
}

/// A device reading as posted by the app: a position, or the platform
/// error the device got instead.
#[derive(Debug, Deserialize, Validate)]
pub struct DeviceSample {
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: Option<f64>,
    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: Option<f64>,
    pub error: Option<LocationError>,
}

impl DeviceSample {
    /// Validate and convert to a location sample.
    pub fn into_sample(self) -> Result<LocationSample> {
        self.validate()
            .map_err(|e| AppError::BadRequest(e.to_string()))?;

        match (self.error, self.latitude, self.longitude) {
            (Some(error), _, _) => Ok(Err(error)),
            (None, Some(latitude), Some(longitude)) => {
                Ok(Ok(Coordinates::new(latitude, longitude)))
            }
            _ => Err(AppError::BadRequest(
                "latitude and longitude are required".to_string(),
            )),
        }
    }
}

/// Build the complete router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    // CORS layer - allow requests from frontend URL and localhost (for dev)
    let frontend_url = state.config.frontend_url.clone();
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::predicate(
            move |origin: &axum::http::HeaderValue, _request_parts: &axum::http::request::Parts| {
                let origin_str = origin.to_str().unwrap_or("");
                origin_str == frontend_url
                    || origin_str.starts_with("http://localhost")
                    || origin_str.starts_with("http://127.0.0.1")
            },
        ))
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    // Public routes (no auth required)
    let public_routes = Router::new().route("/health", get(health_check));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .merge(gyms::routes())
        .merge(presence::routes())
        .merge(occupancy::routes())
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(json: &str) -> Result<LocationSample> {
        serde_json::from_str::<DeviceSample>(json).unwrap().into_sample()
    }

    #[test]
    fn test_device_sample_position() {
        assert_eq!(
            sample(r#"{"latitude": 51.5, "longitude": -0.14}"#).unwrap(),
            Ok(Coordinates::new(51.5, -0.14))
        );
    }

    #[test]
    fn test_device_sample_error() {
        assert_eq!(
            sample(r#"{"error": "permission_denied"}"#).unwrap(),
            Err(LocationError::PermissionDenied)
        );
    }

    #[test]
    fn test_device_sample_rejects_bad_input() {
        assert!(matches!(
            sample(r#"{"latitude": 91.0, "longitude": 0.0}"#),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            sample(r#"{"latitude": 51.5}"#),
            Err(AppError::BadRequest(_))
        ));
    }
}
