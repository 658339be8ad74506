// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - presence and occupancy logic.

pub mod geo;
pub mod gyms;
pub mod location;
pub mod occupancy;
pub mod presence;
pub mod proximity;
pub mod sessions;

pub use gyms::{load_gyms_from_file, GymDirectory, GymSeedError};
pub use location::{DeviceLocationFeed, LocationError, LocationProvider, LocationSample};
pub use occupancy::{OccupancyAggregator, OccupancyPolicy, OccupancyScope, OccupancyView};
pub use presence::{CheckIn, PresenceController, PresencePolicy, PresenceState};
pub use proximity::find_nearest_gym;
pub use sessions::{PresenceSession, PresenceSessions};
