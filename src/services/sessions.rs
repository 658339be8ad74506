// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Per-member presence sessions.
//!
//! A session pairs the member's [`PresenceController`] with the device feed
//! their app reports positions into. Sessions start on first use and end
//! either explicitly or after going idle; either way the watch stops and
//! presence is cleared.

use crate::db::DocumentStore;
use crate::error::Result;
use crate::models::UserId;
use crate::services::gyms::GymDirectory;
use crate::services::location::{DeviceLocationFeed, LocationSample};
use crate::services::presence::{PresenceController, PresencePolicy};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub struct PresenceSession {
    pub controller: PresenceController,
    pub device: DeviceLocationFeed,
    last_used: Mutex<Instant>,
}

impl PresenceSession {
    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Time since the member last made a request on this session.
    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    /// Feed a continuous-mode sample, starting the watch on first use.
    ///
    /// Fails with `Conflict` when auto-presence is disabled.
    pub async fn report(&self, sample: LocationSample) -> Result<()> {
        self.controller.start_watching(&self.device).await?;
        self.device.push(sample);
        Ok(())
    }
}

/// Registry of live sessions keyed by user id.
#[derive(Clone)]
pub struct PresenceSessions {
    store: Arc<dyn DocumentStore>,
    gyms: GymDirectory,
    policy: PresencePolicy,
    idle_timeout: Duration,
    sessions: Arc<DashMap<UserId, Arc<PresenceSession>>>,
}

impl PresenceSessions {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        gyms: GymDirectory,
        policy: PresencePolicy,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            store,
            gyms,
            policy,
            idle_timeout,
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<PresenceSession>> {
        self.sessions.get(user_id).map(|s| s.value().clone())
    }

    /// Existing session for `user_id`, or a new one reconciled with the
    /// stored presence record. Either way the session counts as used.
    pub async fn get_or_start(&self, user_id: &str) -> Arc<PresenceSession> {
        if let Some(session) = self.get(user_id) {
            session.touch();
            return session;
        }

        let session = Arc::new(PresenceSession {
            controller: PresenceController::new(
                user_id,
                self.store.clone(),
                self.gyms.clone(),
                self.policy,
            ),
            device: DeviceLocationFeed::new(),
            last_used: Mutex::new(Instant::now()),
        });
        if let Err(e) = session.controller.restore_from_store().await {
            tracing::warn!(user_id, error = %e, "Could not restore presence, starting fresh");
        }

        tracing::debug!(user_id, "Presence session started");
        self.sessions
            .entry(user_id.to_string())
            .or_insert(session)
            .value()
            .clone()
    }

    /// End the session: stop watching and clear presence. Returns whether a
    /// session existed.
    pub async fn end(&self, user_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(user_id) else {
            return false;
        };
        session.controller.end_session().await;
        tracing::debug!(user_id, "Presence session ended");
        true
    }

    /// End sessions unused for at least the idle timeout. Returns how many
    /// were ended.
    pub async fn end_idle(&self) -> usize {
        let candidates: Vec<UserId> = self
            .sessions
            .iter()
            .filter(|s| s.value().idle_for() >= self.idle_timeout)
            .map(|s| s.key().clone())
            .collect();

        let mut ended = 0;
        for user_id in candidates {
            // Re-checked under the map lock in case a request came in meanwhile
            let removed = self
                .sessions
                .remove_if(&user_id, |_, s| s.idle_for() >= self.idle_timeout);
            if let Some((_, session)) = removed {
                session.controller.end_session().await;
                tracing::info!(user_id = %user_id, "Idle presence session ended");
                ended += 1;
            }
        }
        ended
    }

    /// Periodically end idle sessions until the returned task is aborted.
    pub fn spawn_idle_sweeper(&self) -> JoinHandle<()> {
        let sessions = self.clone();
        let period = (self.idle_timeout / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let ended = sessions.end_idle().await;
                if ended > 0 {
                    tracing::debug!(ended, remaining = sessions.len(), "Idle session sweep");
                }
            }
        })
    }

    /// End every session (shutdown).
    pub async fn end_all(&self) {
        let user_ids: Vec<UserId> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for user_id in user_ids {
            self.end(&user_id).await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::error::AppError;
    use crate::models::{Coordinates, CrowdThresholds, Gym, PresencePatch, Role, User};
    use crate::services::presence::PresenceState;

    const IDLE: Duration = Duration::from_secs(60);
    const NEAR_OXFORD: Coordinates = Coordinates {
        latitude: 51.5154,
        longitude: -0.1410,
    };

    fn setup() -> (MemoryStore, PresenceSessions) {
        let store = MemoryStore::with_gyms([Gym {
            id: "oxford".to_string(),
            name: "MetroGym Oxford".to_string(),
            address: String::new(),
            latitude: Some(51.5154),
            longitude: Some(-0.1410),
            crowd_thresholds: CrowdThresholds::default(),
        }]);
        store.put_user(User {
            id: "u1".to_string(),
            display_name: None,
            email: None,
            primary_gym: Some("oxford".to_string()),
            auto_presence_enabled: true,
            role: Role::Member,
        });
        let gyms = GymDirectory::subscribe(&store);
        let sessions = PresenceSessions::new(
            Arc::new(store.clone()),
            gyms,
            PresencePolicy::default(),
            IDLE,
        );
        (store, sessions)
    }

    async fn wait_for_gym(session: &PresenceSession) {
        for _ in 0..100 {
            if session.controller.current_gym().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_session_reused() {
        let (_store, sessions) = setup();
        let a = sessions.get_or_start("u1").await;
        let b = sessions.get_or_start("u1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_report_then_end_clears() {
        let (store, sessions) = setup();
        let session = sessions.get_or_start("u1").await;
        session.report(Ok(NEAR_OXFORD)).await.unwrap();
        wait_for_gym(&session).await;
        assert_eq!(
            session.controller.status(),
            PresenceState::CheckedIn("oxford".to_string())
        );
        assert_eq!(session.device.watcher_count(), 1);

        assert!(sessions.end("u1").await);
        assert!(sessions.is_empty());
        assert_eq!(session.device.watcher_count(), 0);
        assert!(!store.get_presence("u1").await.unwrap().unwrap().is_active);
        assert!(!sessions.end("u1").await);
    }

    #[tokio::test]
    async fn test_new_session_restores_record() {
        let (store, sessions) = setup();
        store
            .upsert_presence("u1", PresencePatch::check_in("oxford"))
            .await
            .unwrap();

        let session = sessions.get_or_start("u1").await;
        assert_eq!(session.controller.current_gym().as_deref(), Some("oxford"));

        sessions.end_all().await;
        assert!(!store.get_presence("u1").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_report_rechecks_auto_presence() {
        let (store, sessions) = setup();
        let session = sessions.get_or_start("u1").await;
        session.report(Ok(NEAR_OXFORD)).await.unwrap();
        wait_for_gym(&session).await;
        assert_eq!(store.presence_write_count(), 1);

        store.set_auto_presence_enabled("u1", false).await.unwrap();

        let result = session.report(Ok(NEAR_OXFORD)).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
        assert_eq!(session.controller.status(), PresenceState::Idle);
        assert_eq!(session.device.watcher_count(), 0);
        assert!(!store.get_presence("u1").await.unwrap().unwrap().is_active);
        assert_eq!(store.presence_write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_ended_and_cleared() {
        let (store, sessions) = setup();
        let session = sessions.get_or_start("u1").await;
        session.report(Ok(NEAR_OXFORD)).await.unwrap();
        wait_for_gym(&session).await;

        tokio::time::advance(IDLE / 2).await;
        assert_eq!(sessions.end_idle().await, 0);

        // A request resets the idle clock
        sessions.get_or_start("u1").await;
        tokio::time::advance(IDLE / 2 + Duration::from_secs(1)).await;
        assert_eq!(sessions.end_idle().await, 0);

        tokio::time::advance(IDLE).await;
        assert_eq!(sessions.end_idle().await, 1);
        assert!(sessions.is_empty());
        assert_eq!(session.device.watcher_count(), 0);
        assert!(!store.get_presence("u1").await.unwrap().unwrap().is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweeper_ends_forgotten_sessions() {
        let (store, sessions) = setup();
        store
            .upsert_presence("u1", PresencePatch::check_in("oxford"))
            .await
            .unwrap();
        sessions.get_or_start("u1").await;
        let sweeper = sessions.spawn_idle_sweeper();

        tokio::time::sleep(IDLE * 2).await;
        assert!(sessions.is_empty());
        assert!(!store.get_presence("u1").await.unwrap().unwrap().is_active);
        sweeper.abort();
    }
}
