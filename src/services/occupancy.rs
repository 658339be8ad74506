// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Live occupancy.
//!
//! Counts active presence records per gym, ignoring records whose
//! `last_seen` is older than the freshness window. Expiry is a read-time
//! filter only; stale records are never corrected here. Every snapshot from
//! the store triggers a full recount.

use crate::db::{DocumentStore, Feed, FeedState, SubscriptionHandle};
use crate::error::{AppError, Result};
use crate::models::{CrowdStatus, CrowdThresholds, Gym, GymId, PresenceFilter, PresenceRecord};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::watch;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Freshness window for counting a record as live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccupancyPolicy {
    pub freshness_window: Duration,
}

impl Default for OccupancyPolicy {
    fn default() -> Self {
        Self {
            freshness_window: Duration::minutes(5),
        }
    }
}

/// Live visitors at `gym_id` as of `now`.
pub fn count_for_gym(
    records: &[PresenceRecord],
    gym_id: &str,
    now: DateTime<Utc>,
    window: Duration,
) -> u32 {
    records
        .iter()
        .filter(|r| r.active_gym() == Some(gym_id) && r.is_fresh(now, window))
        .count() as u32
}

/// Live visitors per gym as of `now`, in one pass.
///
/// Every gym named by an active record gets an entry, even when all of its
/// records are stale.
pub fn count_all(
    records: &[PresenceRecord],
    now: DateTime<Utc>,
    window: Duration,
) -> BTreeMap<GymId, u32> {
    let mut counts = BTreeMap::new();
    for record in records {
        let Some(gym_id) = record.active_gym() else {
            continue;
        };
        let count = counts.entry(gym_id.to_string()).or_insert(0);
        if record.is_fresh(now, window) {
            *count += 1;
        }
    }
    counts
}

/// Which records an aggregator follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OccupancyScope {
    AllGyms,
    Gym(GymId),
}

impl OccupancyScope {
    fn filter(&self) -> PresenceFilter {
        match self {
            OccupancyScope::AllGyms => PresenceFilter::active(),
            OccupancyScope::Gym(gym_id) => PresenceFilter::active_at(gym_id.clone()),
        }
    }

    fn counts(
        &self,
        records: &[PresenceRecord],
        now: DateTime<Utc>,
        window: Duration,
    ) -> BTreeMap<GymId, u32> {
        match self {
            OccupancyScope::AllGyms => count_all(records, now, window),
            OccupancyScope::Gym(gym_id) => {
                BTreeMap::from([(gym_id.clone(), count_for_gym(records, gym_id, now, window))])
            }
        }
    }
}

/// Result of the latest recount, pushed to watchers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OccupancyView {
    Loading,
    Ready {
        counts: BTreeMap<GymId, u32>,
        computed_at: DateTime<Utc>,
    },
    /// Feed error; no count is trusted until the next snapshot
    Unavailable { error: String },
}

/// Push-driven occupancy counter over a presence subscription.
///
/// Call [`stop`](Self::stop) (or drop the aggregator) when the owning view
/// goes away; the store subscription lives until then.
pub struct OccupancyAggregator {
    scope: OccupancyScope,
    policy: OccupancyPolicy,
    /// Latest snapshot, for counting at query time
    records: Mutex<Option<Feed<Vec<PresenceRecord>>>>,
    view: watch::Receiver<OccupancyView>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl OccupancyAggregator {
    pub fn start(store: &dyn DocumentStore, scope: OccupancyScope, policy: OccupancyPolicy) -> Self {
        let feed = store.subscribe_presence(scope.filter());
        let (view_tx, view) = watch::channel(OccupancyView::Loading);

        let handler_scope = scope.clone();
        let subscription = feed.clone().on_update(move |state| {
            let next = match &state {
                FeedState::Loading => OccupancyView::Loading,
                FeedState::Failed(error) => {
                    tracing::warn!(error = %error, scope = ?handler_scope, "Presence feed failed");
                    OccupancyView::Unavailable {
                        error: error.clone(),
                    }
                }
                FeedState::Ready(snapshot) => {
                    let now = Utc::now();
                    OccupancyView::Ready {
                        counts: handler_scope.counts(snapshot, now, policy.freshness_window),
                        computed_at: now,
                    }
                }
            };
            view_tx.send_replace(next);
        });

        tracing::debug!(scope = ?scope, "Occupancy aggregator started");
        Self {
            scope,
            policy,
            records: Mutex::new(Some(feed)),
            view,
            subscription: Mutex::new(Some(subscription)),
        }
    }

    pub fn scope(&self) -> &OccupancyScope {
        &self.scope
    }

    /// Live visitors at `gym_id` now.
    pub fn occupancy(&self, gym_id: &str) -> Result<u32> {
        self.occupancy_at(gym_id, Utc::now())
    }

    pub fn occupancy_at(&self, gym_id: &str, now: DateTime<Utc>) -> Result<u32> {
        self.with_records(|records| {
            count_for_gym(records, gym_id, now, self.policy.freshness_window)
        })
    }

    /// Live visitors for every gym with an active record.
    pub fn occupancy_all(&self) -> Result<BTreeMap<GymId, u32>> {
        self.occupancy_all_at(Utc::now())
    }

    pub fn occupancy_all_at(&self, now: DateTime<Utc>) -> Result<BTreeMap<GymId, u32>> {
        self.with_records(|records| count_all(records, now, self.policy.freshness_window))
    }

    /// Receiver for recount results.
    pub fn watch(&self) -> watch::Receiver<OccupancyView> {
        self.view.clone()
    }

    pub fn is_active(&self) -> bool {
        self.subscription
            .lock()
            .as_ref()
            .is_some_and(|s| s.is_active())
    }

    /// Tear down the store subscription. No recount happens afterwards.
    pub async fn stop(&self) {
        self.records.lock().take();
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe().await;
            tracing::debug!(scope = ?self.scope, "Occupancy aggregator stopped");
        }
    }

    fn with_records<R>(&self, f: impl FnOnce(&[PresenceRecord]) -> R) -> Result<R> {
        let state = self.records.lock().as_ref().map(Feed::current);
        match state {
            Some(FeedState::Ready(records)) => Ok(f(&records)),
            Some(FeedState::Loading) => Err(AppError::Unavailable(
                "Occupancy is still loading".to_string(),
            )),
            Some(FeedState::Failed(error)) => Err(AppError::Unavailable(error)),
            None => Err(AppError::Unavailable(
                "Occupancy aggregator stopped".to_string(),
            )),
        }
    }
}

// ─── Admin overview ──────────────────────────────────────────────

/// One row of the admin overview.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct GymOccupancy {
    pub gym_id: GymId,
    pub gym_name: String,
    pub count: u32,
    pub status: CrowdStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct OccupancyOverview {
    pub gyms: Vec<GymOccupancy>,
    pub total: u32,
    /// Highest count; `None` when nobody is in
    pub busiest: Option<GymOccupancy>,
}

/// Combine counts with the gym list.
///
/// Every known gym gets a row, 0 if absent from `counts`. Counts for gyms
/// missing from the list are kept under their id.
pub fn build_overview(counts: &BTreeMap<GymId, u32>, gyms: &[Gym]) -> OccupancyOverview {
    let mut rows: Vec<GymOccupancy> = gyms
        .iter()
        .map(|gym| {
            let count = counts.get(&gym.id).copied().unwrap_or(0);
            GymOccupancy {
                gym_id: gym.id.clone(),
                gym_name: gym.name.clone(),
                count,
                status: gym.crowd_thresholds.status(count),
            }
        })
        .collect();

    for (gym_id, &count) in counts {
        if gyms.iter().all(|g| &g.id != gym_id) {
            rows.push(GymOccupancy {
                gym_id: gym_id.clone(),
                gym_name: gym_id.clone(),
                count,
                status: CrowdThresholds::default().status(count),
            });
        }
    }

    let total = rows.iter().map(|r| r.count).sum();
    let busiest = rows
        .iter()
        .filter(|r| r.count > 0)
        .max_by(|a, b| a.count.cmp(&b.count).then_with(|| b.gym_id.cmp(&a.gym_id)))
        .cloned();

    OccupancyOverview {
        gyms: rows,
        total,
        busiest,
    }
}
