// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Gym model and crowd-level thresholds.

use crate::models::Coordinates;
use serde::{Deserialize, Serialize};
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Gym document ID.
pub type GymId = String;

/// A club location members can check in to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct Gym {
    /// Document ID (e.g. "oxford")
    pub id: GymId,
    /// Display name (e.g. "MetroGym Oxford")
    pub name: String,
    pub address: String,
    /// Decimal degrees; gyms without both coordinates never match a device.
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub crowd_thresholds: CrowdThresholds,
}

impl Gym {
    /// Gym position, if both coordinates are present and finite.
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => {
                Some(Coordinates::new(lat, lon))
            }
            _ => None,
        }
    }
}

/// Occupancy thresholds set by an administrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct CrowdThresholds {
    pub low: u32,
    pub moderate: u32,
    pub packed: u32,
}

impl Default for CrowdThresholds {
    fn default() -> Self {
        Self {
            low: 20,
            moderate: 50,
            packed: 80,
        }
    }
}

impl CrowdThresholds {
    /// Classify a live count.
    ///
    /// Thresholds are checked from the top down, so a misconfigured set
    /// (e.g. `packed < moderate`) still yields a single answer.
    pub fn status(&self, count: u32) -> CrowdStatus {
        if count >= self.packed {
            CrowdStatus::Packed
        } else if count >= self.moderate {
            CrowdStatus::Moderate
        } else if count >= self.low {
            CrowdStatus::Low
        } else {
            CrowdStatus::Quiet
        }
    }
}

/// Crowd level derived from occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub enum CrowdStatus {
    Quiet,
    Low,
    Moderate,
    Packed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gym(lat: Option<f64>, lon: Option<f64>) -> Gym {
        Gym {
            id: "oxford".to_string(),
            name: "MetroGym Oxford".to_string(),
            address: "1 Oxford St".to_string(),
            latitude: lat,
            longitude: lon,
            crowd_thresholds: CrowdThresholds::default(),
        }
    }

    #[test]
    fn test_coordinates_require_both_components() {
        assert!(gym(Some(51.5), None).coordinates().is_none());
        assert!(gym(None, Some(-0.1)).coordinates().is_none());
        assert!(gym(Some(f64::NAN), Some(-0.1)).coordinates().is_none());
        assert_eq!(
            gym(Some(51.5), Some(-0.1)).coordinates(),
            Some(Coordinates::new(51.5, -0.1))
        );
    }

    #[test]
    fn test_crowd_status_partitions() {
        let t = CrowdThresholds::default();
        assert_eq!(t.status(0), CrowdStatus::Quiet);
        assert_eq!(t.status(19), CrowdStatus::Quiet);
        assert_eq!(t.status(20), CrowdStatus::Low);
        assert_eq!(t.status(50), CrowdStatus::Moderate);
        assert_eq!(t.status(79), CrowdStatus::Moderate);
        assert_eq!(t.status(80), CrowdStatus::Packed);
        assert_eq!(t.status(500), CrowdStatus::Packed);
    }

    #[test]
    fn test_crowd_status_zero_thresholds() {
        let t = CrowdThresholds {
            low: 0,
            moderate: 0,
            packed: 0,
        };
        assert_eq!(t.status(0), CrowdStatus::Packed);
    }
}
