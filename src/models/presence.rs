// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Per-user presence record.
//!
//! One document per user in `userPresence`, written with merge semantics.
//! An active record only means "near `gym_id` as of `last_seen`"; readers
//! decide whether it is still fresh.

use crate::models::{GymId, UserId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Stored presence document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: UserId,
    /// Gym last checked in to; kept on checkout
    pub gym_id: Option<GymId>,
    pub is_active: bool,
    /// Assigned by the store on every write
    pub last_seen: DateTime<Utc>,
}

impl PresenceRecord {
    /// Active and seen within `window` of `now`.
    ///
    /// A `last_seen` ahead of `now` (clock skew) counts as fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.is_active && now.signed_duration_since(self.last_seen) <= window
    }

    /// Active gym, ignoring freshness.
    pub fn active_gym(&self) -> Option<&str> {
        if self.is_active {
            self.gym_id.as_deref()
        } else {
            None
        }
    }
}

/// Fields merged into a presence document by an upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresencePatch {
    /// `None` leaves the stored gym untouched
    pub gym_id: Option<GymId>,
    pub is_active: bool,
}

impl PresencePatch {
    pub fn check_in(gym_id: impl Into<GymId>) -> Self {
        Self {
            gym_id: Some(gym_id.into()),
            is_active: true,
        }
    }

    pub fn clear() -> Self {
        Self {
            gym_id: None,
            is_active: false,
        }
    }

    /// Merge into an existing record (or create one), stamping `now`.
    pub fn apply(
        &self,
        user_id: &str,
        existing: Option<PresenceRecord>,
        now: DateTime<Utc>,
    ) -> PresenceRecord {
        let gym_id = match (&self.gym_id, existing) {
            (Some(gym), _) => Some(gym.clone()),
            (None, Some(prev)) => prev.gym_id,
            (None, None) => None,
        };
        PresenceRecord {
            user_id: user_id.to_string(),
            gym_id,
            is_active: self.is_active,
            last_seen: now,
        }
    }
}

/// Query over presence documents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceFilter {
    pub gym_id: Option<GymId>,
    pub is_active: Option<bool>,
}

impl PresenceFilter {
    /// All active records.
    pub fn active() -> Self {
        Self {
            gym_id: None,
            is_active: Some(true),
        }
    }

    /// Active records for one gym.
    pub fn active_at(gym_id: impl Into<GymId>) -> Self {
        Self {
            gym_id: Some(gym_id.into()),
            is_active: Some(true),
        }
    }

    pub fn matches(&self, record: &PresenceRecord) -> bool {
        let gym_ok = match &self.gym_id {
            Some(gym) => record.gym_id.as_ref() == Some(gym),
            None => true,
        };
        let active_ok = self.is_active.map_or(true, |a| record.is_active == a);
        gym_ok && active_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap()
    }

    #[test]
    fn test_clear_keeps_gym() {
        let checked_in = PresencePatch::check_in("oxford").apply("u1", None, t0());
        assert_eq!(checked_in.gym_id.as_deref(), Some("oxford"));
        assert!(checked_in.is_active);

        let later = t0() + Duration::minutes(10);
        let cleared = PresencePatch::clear().apply("u1", Some(checked_in), later);
        assert_eq!(cleared.gym_id.as_deref(), Some("oxford"));
        assert!(!cleared.is_active);
        assert_eq!(cleared.last_seen, later);
    }

    #[test]
    fn test_clear_creates_inactive_record() {
        let record = PresencePatch::clear().apply("u1", None, t0());
        assert_eq!(record.gym_id, None);
        assert!(!record.is_active);
    }

    #[test]
    fn test_freshness_window() {
        let window = Duration::minutes(5);
        let mut record = PresencePatch::check_in("oxford").apply("u1", None, t0());

        assert!(record.is_fresh(t0() + Duration::minutes(4), window));
        assert!(record.is_fresh(t0() + Duration::minutes(5), window));
        assert!(!record.is_fresh(t0() + Duration::minutes(6), window));
        // Skewed clock: record from the "future"
        assert!(record.is_fresh(t0() - Duration::seconds(30), window));

        record.is_active = false;
        assert!(!record.is_fresh(t0(), window));
    }

    #[test]
    fn test_filter_matches() {
        let record = PresencePatch::check_in("oxford").apply("u1", None, t0());
        assert!(PresenceFilter::active().matches(&record));
        assert!(PresenceFilter::active_at("oxford").matches(&record));
        assert!(!PresenceFilter::active_at("soho").matches(&record));
        assert!(PresenceFilter::default().matches(&record));

        let cleared = PresencePatch::clear().apply("u1", Some(record), t0());
        assert!(!PresenceFilter::active_at("oxford").matches(&cleared));
        assert!(PresenceFilter::default().matches(&cleared));
    }
}
