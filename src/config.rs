//! Application configuration loaded from environment variables.
//!
//! Presence tuning (radius, freshness window, location timeout) is read
//! once at startup and handed to the services as typed policies.

use crate::services::occupancy::OccupancyPolicy;
use crate::services::presence::PresencePolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which document store backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Firestore,
    /// In-process store, for local development and tests
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "firestore" => Ok(StoreBackend::Firestore),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(ConfigError::Invalid("STORE_BACKEND", s.to_string())),
        }
    }
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Frontend URL for CORS
    pub frontend_url: String,
    /// GCP project ID
    pub gcp_project_id: String,
    /// Server port
    pub port: u16,
    /// JWT signing key for session tokens (raw bytes)
    pub jwt_signing_key: Vec<u8>,

    pub store_backend: StoreBackend,
    /// GeoJSON gym seed applied at startup
    pub gym_seed_path: Option<String>,

    // --- Presence policy ---
    pub proximity_radius_meters: f64,
    pub freshness_window: Duration,
    pub location_timeout: Duration,
    /// Delay before a dropped Firestore listener reconnects
    pub listen_retry_delay: Duration,
    /// Sessions with no request for this long are ended
    pub session_idle_timeout: Duration,
}

impl Config {
    /// Default config for testing only.
    pub fn test_default() -> Self {
        Self {
            frontend_url: "http://localhost:9002".to_string(),
            gcp_project_id: "test-project".to_string(),
            port: 8080,
            jwt_signing_key: b"test_jwt_key_32_bytes_minimum!!".to_vec(),
            store_backend: StoreBackend::Memory,
            gym_seed_path: None,
            proximity_radius_meters: 100.0,
            freshness_window: Duration::from_secs(5 * 60),
            location_timeout: Duration::from_secs(20),
            listen_retry_delay: Duration::from_secs(5),
            session_idle_timeout: Duration::from_secs(15 * 60),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let proximity_radius_meters: f64 = parse_or("PROXIMITY_RADIUS_METERS", 100.0)?;
        if !(proximity_radius_meters.is_finite() && proximity_radius_meters >= 0.0) {
            return Err(ConfigError::Invalid(
                "PROXIMITY_RADIUS_METERS",
                proximity_radius_meters.to_string(),
            ));
        }

        Ok(Self {
            frontend_url: env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:9002".to_string()),
            gcp_project_id: env::var("GCP_PROJECT_ID").unwrap_or_else(|_| "local-dev".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            jwt_signing_key: env::var("JWT_SIGNING_KEY")
                .map_err(|_| ConfigError::Missing("JWT_SIGNING_KEY"))?
                .into_bytes(),
            store_backend: env::var("STORE_BACKEND")
                .map(|v| v.parse())
                .unwrap_or(Ok(StoreBackend::Firestore))?,
            gym_seed_path: env::var("GYM_SEED_PATH").ok().filter(|p| !p.is_empty()),
            proximity_radius_meters,
            freshness_window: Duration::from_secs(parse_or::<u64>("FRESHNESS_WINDOW_SECS", 300)?),
            location_timeout: Duration::from_secs(parse_or::<u64>("LOCATION_TIMEOUT_SECS", 20)?),
            listen_retry_delay: Duration::from_secs(parse_or::<u64>("LISTEN_RETRY_SECS", 5)?.max(1)),
            session_idle_timeout: Duration::from_secs(
                parse_or::<u64>("SESSION_IDLE_TIMEOUT_SECS", 15 * 60)?.max(1),
            ),
        })
    }

    pub fn presence_policy(&self) -> PresencePolicy {
        PresencePolicy {
            radius_meters: self.proximity_radius_meters,
            location_timeout: self.location_timeout,
        }
    }

    pub fn occupancy_policy(&self) -> OccupancyPolicy {
        OccupancyPolicy {
            freshness_window: chrono::Duration::from_std(self.freshness_window)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
        }
    }
}

/// Parse an optional numeric variable, rejecting garbage instead of
/// silently falling back.
fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, raw)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
