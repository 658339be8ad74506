// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Data models for the application.

pub mod gym;
pub mod location;
pub mod presence;
pub mod user;

pub use gym::{CrowdStatus, CrowdThresholds, Gym, GymId};
pub use location::Coordinates;
pub use presence::{PresenceFilter, PresencePatch, PresenceRecord};
pub use user::{Role, User, UserId};
