// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Gym directory: the live gym list used to resolve coordinates and names.

use crate::db::{DocumentStore, Feed, FeedState};
use crate::models::{CrowdThresholds, Gym};
use geojson::GeoJson;
use std::fs;
use std::path::Path;

/// Live view over the `gyms` collection.
///
/// Holds the store subscription for as long as the directory lives.
#[derive(Clone)]
pub struct GymDirectory {
    feed: Feed<Vec<Gym>>,
}

impl GymDirectory {
    /// Subscribe to the store's gym feed.
    pub fn subscribe(store: &dyn DocumentStore) -> Self {
        Self {
            feed: store.subscribe_gyms(),
        }
    }

    /// Current gyms. Empty while loading or after a feed failure.
    pub fn gyms(&self) -> Vec<Gym> {
        match self.feed.current() {
            FeedState::Ready(gyms) => gyms,
            FeedState::Loading => Vec::new(),
            FeedState::Failed(error) => {
                tracing::warn!(error = %error, "Gym feed unavailable, treating as empty");
                Vec::new()
            }
        }
    }

    pub fn state(&self) -> FeedState<Vec<Gym>> {
        self.feed.current()
    }

    pub fn find(&self, gym_id: &str) -> Option<Gym> {
        self.feed
            .current()
            .ready()
            .and_then(|gyms| gyms.iter().find(|g| g.id == gym_id).cloned())
    }
}

// ─── GeoJSON seed ────────────────────────────────────────────────

/// Load gyms from a GeoJSON file.
pub fn load_gyms_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<Gym>, GymSeedError> {
    let json_data =
        fs::read_to_string(path.as_ref()).map_err(|e| GymSeedError::IoError(e.to_string()))?;
    load_gyms_from_json(&json_data)
}

/// Load gyms from a GeoJSON `FeatureCollection` of `Point` features.
///
/// Properties: `id` and `name` (required), `address`, `thresholdLow`,
/// `thresholdModerate`, `thresholdPacked`.
pub fn load_gyms_from_json(json_data: &str) -> Result<Vec<Gym>, GymSeedError> {
    let geojson: GeoJson = json_data
        .parse()
        .map_err(|e: geojson::Error| GymSeedError::ParseError(e.to_string()))?;

    let GeoJson::FeatureCollection(collection) = geojson else {
        return Err(GymSeedError::NotACollection);
    };

    let mut gyms = Vec::new();
    for feature in collection.features {
        let text = |key: &str| {
            feature
                .property(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let threshold = |key: &str| {
            feature
                .property(key)
                .and_then(|v| v.as_u64())
                .and_then(|n| u32::try_from(n).ok())
        };

        // Skip features without an id (drafts in the admin export)
        let Some(id) = text("id").filter(|id| !id.is_empty()) else {
            continue;
        };
        let name = text("name")
            .filter(|name| !name.is_empty())
            .ok_or_else(|| GymSeedError::MissingName(id.clone()))?;
        let address = text("address").unwrap_or_default();

        let defaults = CrowdThresholds::default();
        let crowd_thresholds = CrowdThresholds {
            low: threshold("thresholdLow").unwrap_or(defaults.low),
            moderate: threshold("thresholdModerate").unwrap_or(defaults.moderate),
            packed: threshold("thresholdPacked").unwrap_or(defaults.packed),
        };

        let (latitude, longitude) = match feature.geometry.as_ref().map(|g| &g.value) {
            Some(value) => {
                let point = point_from(value).ok_or_else(|| GymSeedError::UnsupportedGeometry(id.clone()))?;
                (Some(point.y()), Some(point.x()))
            }
            None => (None, None),
        };

        gyms.push(Gym {
            id,
            name,
            address,
            latitude,
            longitude,
            crowd_thresholds,
        });
    }

    tracing::info!(count = gyms.len(), "Loaded gym seed");
    Ok(gyms)
}

fn point_from(value: &geojson::Value) -> Option<geo::Point<f64>> {
    use std::convert::TryInto;
    value.clone().try_into().ok()
}

/// Errors from loading a gym seed.
#[derive(Debug, thiserror::Error)]
pub enum GymSeedError {
    #[error("Failed to read file: {0}")]
    IoError(String),

    #[error("Failed to parse GeoJSON: {0}")]
    ParseError(String),

    #[error("Expected a FeatureCollection")]
    NotACollection,

    #[error("Gym {0} has non-point geometry")]
    UnsupportedGeometry(String),

    #[error("Gym {0} has no name")]
    MissingName(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    const SEED: &str = r#"{
      "type": "FeatureCollection",
      "features": [
        {
          "type": "Feature",
          "geometry": { "type": "Point", "coordinates": [-0.1410, 51.5154] },
          "properties": { "id": "oxford", "name": "MetroGym Oxford", "address": "1 Oxford St",
                          "thresholdLow": 10, "thresholdModerate": 30, "thresholdPacked": 60 }
        },
        {
          "type": "Feature",
          "geometry": null,
          "properties": { "id": "popup", "name": "MetroGym Pop-up" }
        },
        {
          "type": "Feature",
          "geometry": { "type": "Point", "coordinates": [0.0, 0.0] },
          "properties": { "name": "Draft" }
        }
      ]
    }"#;

    #[test]
    fn test_load_seed() {
        let gyms = load_gyms_from_json(SEED).unwrap();
        assert_eq!(gyms.len(), 2);

        let oxford = &gyms[0];
        assert_eq!(oxford.id, "oxford");
        assert_eq!(oxford.latitude, Some(51.5154));
        assert_eq!(oxford.longitude, Some(-0.1410));
        assert_eq!(oxford.crowd_thresholds.moderate, 30);

        let popup = &gyms[1];
        assert!(popup.coordinates().is_none());
        assert_eq!(popup.crowd_thresholds, CrowdThresholds::default());
    }

    #[test]
    fn test_non_point_geometry_rejected() {
        let json = r#"{"type":"FeatureCollection","features":[{"type":"Feature",
            "geometry":{"type":"LineString","coordinates":[[0,0],[1,1]]},
            "properties":{"id":"bad","name":"Bad"}}]}"#;
        assert!(matches!(
            load_gyms_from_json(json),
            Err(GymSeedError::UnsupportedGeometry(id)) if id == "bad"
        ));
    }

    #[test]
    fn test_missing_name_rejected() {
        let json = r#"{"type":"FeatureCollection","features":[{"type":"Feature",
            "geometry":{"type":"Point","coordinates":[-0.1410,51.5154]},
            "properties":{"id":"nameless"}}]}"#;
        assert!(matches!(
            load_gyms_from_json(json),
            Err(GymSeedError::MissingName(id)) if id == "nameless"
        ));

        let blank = json.replace(r#""id":"nameless""#, r#""id":"nameless","name":"""#);
        assert!(matches!(
            load_gyms_from_json(&blank),
            Err(GymSeedError::MissingName(_))
        ));
    }

    #[test]
    fn test_not_a_collection() {
        let json = r#"{"type":"Point","coordinates":[0,0]}"#;
        assert!(matches!(
            load_gyms_from_json(json),
            Err(GymSeedError::NotACollection)
        ));
        assert!(matches!(
            load_gyms_from_json("not json"),
            Err(GymSeedError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_directory_follows_store() {
        let store = MemoryStore::with_gyms(load_gyms_from_json(SEED).unwrap());
        let directory = GymDirectory::subscribe(&store);
        assert_eq!(directory.find("oxford").unwrap().name, "MetroGym Oxford");
        assert!(directory.find("unknown").is_none());

        store.remove_gym("oxford");
        assert!(directory.find("oxford").is_none());
        assert_eq!(directory.gyms().len(), 1);
    }
}
