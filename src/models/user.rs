//! User model for storage and API.

use crate::models::GymId;
use serde::{Deserialize, Serialize};

/// User ID issued by the auth service (also used as document ID).
pub type UserId = String;

/// Member profile stored in Firestore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Display name (may be None if never set)
    pub display_name: Option<String>,
    pub email: Option<String>,
    /// Home gym; governs which occupancy view the member may read
    pub primary_gym: Option<GymId>,
    /// Opt-in to continuous geolocation check-in
    #[serde(default)]
    pub auto_presence_enabled: bool,
    #[serde(default)]
    pub role: Role,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Whether this user may read live occupancy for `gym_id`.
    pub fn can_view_gym(&self, gym_id: &str) -> bool {
        self.is_admin() || self.primary_gym.as_deref() == Some(gym_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Member,
    Admin,
}
