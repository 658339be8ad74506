// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Presence controller.
//!
//! Keeps one member's presence document in line with where their device is:
//! 1. Continuous mode: watch device positions while auto-presence is on and
//!    write only when the matched gym changes
//! 2. Manual mode: one position, one match, one write (or a clear failure)
//! 3. Teardown: leaving continuous mode or ending the session clears an
//!    active check-in
//!
//! Unknown location counts as "not present". Failed writes are logged and
//! left for the next sample or attempt to repair.

use crate::db::DocumentStore;
use crate::error::{AppError, Result};
use crate::models::{GymId, PresencePatch, UserId};
use crate::services::gyms::GymDirectory;
use crate::services::location::{LocationError, LocationProvider, LocationSample};
use crate::services::proximity::{find_nearest_gym, DEFAULT_RADIUS_METERS};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Tunables for matching and location acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresencePolicy {
    /// Maximum device-to-gym distance, inclusive
    pub radius_meters: f64,
    /// Bound on waiting for a one-shot position
    pub location_timeout: Duration,
}

impl Default for PresencePolicy {
    fn default() -> Self {
        Self {
            radius_meters: DEFAULT_RADIUS_METERS,
            location_timeout: Duration::from_secs(20),
        }
    }
}

/// Controller state as seen by the member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "gym_id", rename_all = "snake_case")]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub enum PresenceState {
    Idle,
    Watching,
    /// Manual check-in waiting for a position
    CheckingIn,
    CheckedIn(GymId),
}

/// Successful manual check-in.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct CheckIn {
    pub gym_id: GymId,
    pub gym_name: String,
    pub distance_meters: f64,
    /// Notification text for the member
    pub message: String,
}

/// What a continuous-mode sample led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Matched gym unchanged; nothing written
    Unchanged,
    CheckedIn(GymId),
    Cleared,
    /// The write was rejected; state left as it was
    WriteFailed,
}

#[derive(Debug, Default)]
struct ControllerState {
    checked_in: Option<GymId>,
    watching: bool,
    checking_in: bool,
}

struct Inner {
    user_id: UserId,
    store: Arc<dyn DocumentStore>,
    gyms: GymDirectory,
    policy: PresencePolicy,
    state: Mutex<ControllerState>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes match-then-write sequences from the watch and from requests
    write_lock: tokio::sync::Mutex<()>,
}

/// Per-member presence controller. Clones share state.
#[derive(Clone)]
pub struct PresenceController {
    inner: Arc<Inner>,
}

impl PresenceController {
    pub fn new(
        user_id: impl Into<UserId>,
        store: Arc<dyn DocumentStore>,
        gyms: GymDirectory,
        policy: PresencePolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                user_id: user_id.into(),
                store,
                gyms,
                policy,
                state: Mutex::new(ControllerState::default()),
                watch_task: Mutex::new(None),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn policy(&self) -> PresencePolicy {
        self.inner.policy
    }

    pub fn status(&self) -> PresenceState {
        let state = self.inner.state.lock();
        if state.checking_in {
            PresenceState::CheckingIn
        } else if let Some(gym) = &state.checked_in {
            PresenceState::CheckedIn(gym.clone())
        } else if state.watching {
            PresenceState::Watching
        } else {
            PresenceState::Idle
        }
    }

    pub fn current_gym(&self) -> Option<GymId> {
        self.inner.state.lock().checked_in.clone()
    }

    pub fn is_watching(&self) -> bool {
        self.inner.state.lock().watching
    }

    /// Adopt an active record left by an earlier session.
    ///
    /// Without this a stale positive record could never be cleared by this
    /// controller. Records pointing at a gym that no longer exists are
    /// cleared outright.
    pub async fn restore_from_store(&self) -> Result<()> {
        let _write = self.inner.write_lock.lock().await;
        let record = self.inner.store.get_presence(&self.inner.user_id).await?;

        let Some(gym_id) = record.as_ref().and_then(|r| r.active_gym()).map(str::to_string) else {
            return Ok(());
        };

        if self.inner.gyms.find(&gym_id).is_some() {
            tracing::debug!(user_id = %self.inner.user_id, gym_id = %gym_id, "Restored active presence");
            self.inner.state.lock().checked_in = Some(gym_id);
        } else {
            tracing::info!(user_id = %self.inner.user_id, gym_id = %gym_id, "Clearing presence at unknown gym");
            self.inner
                .store
                .upsert_presence(&self.inner.user_id, PresencePatch::clear())
                .await?;
        }
        Ok(())
    }

    // ─── Continuous mode ─────────────────────────────────────────

    /// Apply one continuous-mode sample.
    ///
    /// Writes only when the matched gym differs from the current one. A
    /// location error is treated as "no gym".
    pub async fn handle_sample(&self, sample: LocationSample) -> SampleOutcome {
        let _write = self.inner.write_lock.lock().await;
        let user_id = &self.inner.user_id;

        let target = match sample {
            Ok(position) => {
                let gyms = self.inner.gyms.gyms();
                find_nearest_gym(position, &gyms, self.inner.policy.radius_meters)
                    .map(|m| m.gym.id.clone())
            }
            Err(error) => {
                tracing::warn!(user_id = %user_id, error = %error, "Geolocation error, treating as away");
                None
            }
        };

        let current = self.current_gym();
        if target == current {
            return SampleOutcome::Unchanged;
        }

        let patch = match &target {
            Some(gym_id) => PresencePatch::check_in(gym_id.clone()),
            None => PresencePatch::clear(),
        };

        if let Err(e) = self.inner.store.upsert_presence(user_id, patch).await {
            tracing::warn!(user_id = %user_id, error = %e, "Presence write failed");
            return SampleOutcome::WriteFailed;
        }

        self.inner.state.lock().checked_in = target.clone();
        match target {
            Some(gym_id) => {
                tracing::info!(user_id = %user_id, gym_id = %gym_id, "Auto check-in");
                SampleOutcome::CheckedIn(gym_id)
            }
            None => {
                tracing::info!(user_id = %user_id, "Auto check-out");
                SampleOutcome::Cleared
            }
        }
    }

    /// Start following `provider` (Idle → Watching).
    ///
    /// The auto-presence flag is re-read on every call, so a flag turned off
    /// elsewhere is noticed on the next sample: the watch stops, an active
    /// check-in is cleared and the call fails with `Conflict`. A no-op if
    /// already watching.
    pub async fn start_watching(&self, provider: &dyn LocationProvider) -> Result<()> {
        let enabled = self
            .inner
            .store
            .get_auto_presence_enabled(&self.inner.user_id)
            .await?;
        if !enabled {
            if self.is_watching() {
                tracing::info!(user_id = %self.inner.user_id, "Auto-presence turned off, leaving watch");
                self.stop_watching().await?;
            }
            return Err(AppError::Conflict("auto-presence is disabled".to_string()));
        }
        if self.is_watching() {
            return Ok(());
        }

        let mut task_slot = self.inner.watch_task.lock();
        if task_slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }

        // Set before spawning so a watch that ends at once still lands in Idle
        self.inner.state.lock().watching = true;
        let mut watch = provider.watch_position();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(sample) = watch.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                PresenceController { inner }.handle_sample(sample).await;
            }
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().watching = false;
                tracing::debug!(user_id = %inner.user_id, "Location watch ended");
            }
        });

        *task_slot = Some(task);
        tracing::info!(user_id = %self.inner.user_id, "Started watching location");
        Ok(())
    }

    /// Stop watching (Watching → Idle), clearing an active check-in.
    pub async fn stop_watching(&self) -> Result<()> {
        // A sample holding the lock finishes its write and records it first
        let write = self.inner.write_lock.lock().await;
        let task = self.inner.watch_task.lock().take();
        let Some(task) = task else {
            return Ok(());
        };

        task.abort();
        let _ = task.await;
        self.inner.state.lock().watching = false;
        tracing::info!(user_id = %self.inner.user_id, "Stopped watching location");

        self.clear_locked(&write).await
    }

    /// Persist the auto-presence flag and follow it.
    ///
    /// Enabling starts watching when a provider is given. Disabling stops
    /// the watch and clears any active check-in.
    pub async fn set_auto_presence(
        &self,
        enabled: bool,
        provider: Option<&dyn LocationProvider>,
    ) -> Result<()> {
        self.inner
            .store
            .set_auto_presence_enabled(&self.inner.user_id, enabled)
            .await?;

        if enabled {
            if let Some(provider) = provider {
                self.start_watching(provider).await?;
            }
            Ok(())
        } else if self.is_watching() {
            self.stop_watching().await
        } else {
            self.clear_if_checked_in().await
        }
    }

    // ─── Manual mode ─────────────────────────────────────────────

    /// One-shot check-in from a single position.
    ///
    /// Independent of auto-presence. Writes only when a gym is in range.
    pub async fn manual_check_in(&self, provider: &dyn LocationProvider) -> Result<CheckIn> {
        let _checking = CheckingIn::enter(&self.inner);
        let user_id = &self.inner.user_id;

        let position = tokio::time::timeout(
            self.inner.policy.location_timeout,
            provider.current_position(),
        )
        .await
        .unwrap_or(Err(LocationError::Timeout))
        .map_err(|e| {
            tracing::info!(user_id = %user_id, error = %e, "Manual check-in: no location");
            AppError::LocationUnavailable(e.to_string())
        })?;

        let gyms = self.inner.gyms.gyms();
        let radius = self.inner.policy.radius_meters;
        let found = find_nearest_gym(position, &gyms, radius).ok_or_else(|| {
            tracing::info!(user_id = %user_id, "Manual check-in: no gym nearby");
            AppError::NoGymNearby(format!("Could not find a gym within {} meters.", radius))
        })?;

        let gym_id = found.gym.id.clone();
        let gym_name = found.gym.name.clone();
        let distance_meters = found.distance_meters;

        {
            let _write = self.inner.write_lock.lock().await;
            self.inner
                .store
                .upsert_presence(user_id, PresencePatch::check_in(gym_id.clone()))
                .await
                .inspect_err(|e| {
                    tracing::warn!(user_id = %user_id, error = %e, "Manual check-in write failed");
                })?;
            self.inner.state.lock().checked_in = Some(gym_id.clone());
        }

        tracing::info!(user_id = %user_id, gym_id = %gym_id, distance_meters, "Manual check-in");
        Ok(CheckIn {
            message: format!("Welcome to {}", gym_name),
            gym_id,
            gym_name,
            distance_meters,
        })
    }

    /// Clear an active check-in. Returns whether anything was written.
    pub async fn check_out(&self) -> Result<bool> {
        let was_checked_in = self.current_gym().is_some();
        self.clear_if_checked_in().await?;
        Ok(was_checked_in)
    }

    /// Tear down at session end: stop watching and clear any check-in.
    pub async fn end_session(&self) {
        if let Err(e) = self.stop_watching().await {
            tracing::warn!(user_id = %self.inner.user_id, error = %e, "Presence clear failed at session end");
        }
        if let Err(e) = self.clear_if_checked_in().await {
            tracing::warn!(user_id = %self.inner.user_id, error = %e, "Presence clear failed at session end");
        }
    }

    async fn clear_if_checked_in(&self) -> Result<()> {
        let write = self.inner.write_lock.lock().await;
        self.clear_locked(&write).await
    }

    /// Clear an active check-in while holding the write lock.
    async fn clear_locked(&self, _write: &tokio::sync::MutexGuard<'_, ()>) -> Result<()> {
        let Some(gym_id) = self.current_gym() else {
            return Ok(());
        };

        self.inner
            .store
            .upsert_presence(&self.inner.user_id, PresencePatch::clear())
            .await
            .inspect_err(|e| {
                tracing::warn!(user_id = %self.inner.user_id, error = %e, "Presence clear failed");
            })?;

        self.inner.state.lock().checked_in = None;
        tracing::info!(user_id = %self.inner.user_id, gym_id = %gym_id, "Checked out");
        Ok(())
    }
}

/// Marks a manual check-in in flight for as long as it is held.
struct CheckingIn<'a>(&'a Inner);

impl<'a> CheckingIn<'a> {
    fn enter(inner: &'a Inner) -> Self {
        inner.state.lock().checking_in = true;
        Self(inner)
    }
}

impl Drop for CheckingIn<'_> {
    fn drop(&mut self) {
        self.0.state.lock().checking_in = false;
    }
}
