// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use axum::body::Body;
use axum::http::{header, Request, Response};
use metrogym_presence::config::Config;
use metrogym_presence::db::{FirestoreDb, MemoryStore};
use metrogym_presence::middleware::auth::create_jwt;
use metrogym_presence::models::{Gym, Role, User};
use metrogym_presence::routes::create_router;
use metrogym_presence::services::load_gyms_from_file;
use metrogym_presence::AppState;
use std::sync::Arc;
use std::time::Duration;

/// Check if emulator is available via environment variable.
#[allow(dead_code)]
pub fn emulator_available() -> bool {
    std::env::var("FIRESTORE_EMULATOR_HOST").is_ok()
}

/// Skip test with message if emulator not available.
#[macro_export]
macro_rules! require_emulator {
    () => {
        if !crate::common::emulator_available() {
            eprintln!("⚠️  Skipping: FIRESTORE_EMULATOR_HOST not set");
            return;
        }
    };
}

/// Create a test database connection.
#[allow(dead_code)]
pub async fn test_db() -> FirestoreDb {
    FirestoreDb::new("test-project")
        .await
        .expect("Failed to connect to Firestore emulator")
        .with_retry_delay(Duration::from_millis(100))
}

/// The London gyms from the bundled seed.
#[allow(dead_code)]
pub fn seed_gyms() -> Vec<Gym> {
    load_gyms_from_file("data/gyms.geojson").expect("Failed to load gym seed")
}

#[allow(dead_code)]
pub fn member(id: &str, primary_gym: Option<&str>, auto_presence: bool) -> User {
    User {
        id: id.to_string(),
        display_name: Some(format!("Member {}", id)),
        email: Some(format!("{}@example.com", id)),
        primary_gym: primary_gym.map(str::to_string),
        auto_presence_enabled: auto_presence,
        role: Role::Member,
    }
}

/// Create a test app over an in-memory store seeded with gyms and users:
/// - `member`: primary gym oxford, auto-presence off
/// - `auto`: primary gym oxford, auto-presence on
/// - `drifter`: no primary gym
/// - `admin`: admin
///
/// Returns the router, the shared state and a handle on the store.
#[allow(dead_code)]
pub fn create_test_app() -> (axum::Router, Arc<AppState>, MemoryStore) {
    let store = MemoryStore::with_gyms(seed_gyms());
    store.put_user(member("member", Some("oxford"), false));
    store.put_user(member("auto", Some("oxford"), true));
    store.put_user(member("drifter", None, false));
    store.put_user(User {
        role: Role::Admin,
        ..member("admin", None, false)
    });

    let state = Arc::new(AppState::new(Config::test_default(), Arc::new(store.clone())));
    (create_router(state.clone()), state, store)
}

/// Signed session token for `user_id`.
#[allow(dead_code)]
pub fn token_for(state: &AppState, user_id: &str) -> String {
    create_jwt(user_id, &state.config.jwt_signing_key).expect("Failed to sign token")
}

/// Build an authenticated request with an optional JSON body.
#[allow(dead_code)]
pub fn authed(method: &str, uri: &str, token: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token));

    match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Read a response body as JSON.
#[allow(dead_code)]
pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Poll `check` until it returns true or a second passes.
#[allow(dead_code)]
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
