// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Great-circle distance.

use geo::{Distance, HaversineMeasure, Point};

/// Earth radius used for all proximity checks.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

const EARTH: HaversineMeasure = HaversineMeasure::new(EARTH_RADIUS_METERS);

/// Haversine distance in meters between two (lat, lon) pairs in degrees.
///
/// NaN inputs propagate to a NaN result.
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    distance_between(Point::new(lon1, lat1), Point::new(lon2, lat2))
}

/// Haversine distance between two geo points (x = longitude, y = latitude).
pub fn distance_between(a: Point<f64>, b: Point<f64>) -> f64 {
    EARTH.distance(a, b)
}
