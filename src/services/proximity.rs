// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Nearest-gym matching for a device position.

use crate::models::{Coordinates, Gym};
use crate::services::geo::distance_between;
use std::cmp::Ordering;

/// Default check-in radius.
pub const DEFAULT_RADIUS_METERS: f64 = 100.0;

/// A gym within the radius and its distance from the device.
#[derive(Debug, Clone, PartialEq)]
pub struct GymMatch<'a> {
    pub gym: &'a Gym,
    pub distance_meters: f64,
}

/// Find the nearest gym within `radius_meters` (inclusive) of `device`.
///
/// Gyms without coordinates are skipped. When two gyms are exactly
/// equidistant the lower gym id wins, so the result does not depend on
/// the order gyms arrive from the store.
pub fn find_nearest_gym<'a>(
    device: Coordinates,
    gyms: &'a [Gym],
    radius_meters: f64,
) -> Option<GymMatch<'a>> {
    if !device.is_finite() {
        return None;
    }

    gyms.iter()
        .filter_map(|gym| {
            let position = gym.coordinates()?;
            let distance_meters = distance_between(device.into(), position.into());
            (distance_meters <= radius_meters).then_some(GymMatch {
                gym,
                distance_meters,
            })
        })
        .min_by(|a, b| {
            a.distance_meters
                .partial_cmp(&b.distance_meters)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.gym.id.cmp(&b.gym.id))
        })
}
