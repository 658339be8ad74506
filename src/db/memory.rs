// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-process document store.
//!
//! Mirrors the behaviour the presence core relies on from Firestore: merge
//! upserts with a store-assigned `last_seen`, and query subscriptions that
//! push a fresh snapshot after every matching write. Also exposes hooks for
//! tests (write counting, failure injection, a settable clock).

use crate::db::{DocumentStore, Feed, FeedSender, FeedState};
use crate::error::{AppError, Result};
use crate::models::{Gym, PresenceFilter, PresencePatch, PresenceRecord, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory store. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    users: DashMap<String, User>,
    gyms: DashMap<String, Gym>,
    presence: DashMap<String, PresenceRecord>,

    presence_feeds: Mutex<Vec<(PresenceFilter, FeedSender<Vec<PresenceRecord>>)>>,
    gym_feeds: Mutex<Vec<FeedSender<Vec<Gym>>>>,

    presence_writes: AtomicUsize,
    fail_writes: AtomicBool,
    write_ack_delay: Mutex<Option<Duration>>,
    clock: Mutex<Option<DateTime<Utc>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with gyms.
    pub fn with_gyms(gyms: impl IntoIterator<Item = Gym>) -> Self {
        let store = Self::new();
        for gym in gyms {
            store.inner.gyms.insert(gym.id.clone(), gym);
        }
        store
    }

    // ─── Admin-side writes ───────────────────────────────────────

    pub fn put_user(&self, user: User) {
        self.inner.users.insert(user.id.clone(), user);
    }

    pub fn put_gym(&self, gym: Gym) {
        self.inner.gyms.insert(gym.id.clone(), gym);
        self.publish_gyms();
    }

    pub fn remove_gym(&self, gym_id: &str) {
        self.inner.gyms.remove(gym_id);
        self.publish_gyms();
    }

    /// Write a presence document verbatim (bypassing merge and stamping).
    pub fn put_presence(&self, record: PresenceRecord) {
        self.inner.presence.insert(record.user_id.clone(), record);
        self.publish_presence();
    }

    // ─── Test hooks ──────────────────────────────────────────────

    /// Number of presence upserts accepted so far.
    pub fn presence_write_count(&self) -> usize {
        self.inner.presence_writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent presence upsert fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Hold every presence upsert for `delay` after it has been committed,
    /// like a slow acknowledgement from a remote store.
    pub fn set_write_ack_delay(&self, delay: Option<Duration>) {
        *self.inner.write_ack_delay.lock() = delay;
    }

    /// Pin the store clock; `None` returns to wall-clock time.
    pub fn set_clock(&self, now: Option<DateTime<Utc>>) {
        *self.inner.clock.lock() = now;
    }

    /// Push an error to every open presence subscription.
    pub fn fail_presence_feeds(&self, message: &str) {
        let mut feeds = self.inner.presence_feeds.lock();
        feeds.retain(|(_, tx)| !tx.is_closed());
        for (_, tx) in feeds.iter() {
            tx.send_replace(FeedState::Failed(message.to_string()));
        }
    }

    /// Presence and gym subscriptions that still have a live receiver.
    pub fn live_subscriptions(&self) -> usize {
        let presence = self
            .inner
            .presence_feeds
            .lock()
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count();
        let gyms = self
            .inner
            .gym_feeds
            .lock()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count();
        presence + gyms
    }

    fn now(&self) -> DateTime<Utc> {
        (*self.inner.clock.lock()).unwrap_or_else(Utc::now)
    }

    // ─── Snapshot fan-out ────────────────────────────────────────

    fn presence_snapshot(&self, filter: &PresenceFilter) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self
            .inner
            .presence
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        records
    }

    fn gyms_snapshot(&self) -> Vec<Gym> {
        let mut gyms: Vec<Gym> = self
            .inner
            .gyms
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        gyms.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        gyms
    }

    fn publish_presence(&self) {
        let mut feeds = self.inner.presence_feeds.lock();
        feeds.retain(|(_, tx)| !tx.is_closed());
        for (filter, tx) in feeds.iter() {
            let next = FeedState::Ready(self.presence_snapshot(filter));
            tx.send_if_modified(|current| {
                if *current == next {
                    false
                } else {
                    *current = next;
                    true
                }
            });
        }
    }

    fn publish_gyms(&self) {
        let snapshot = self.gyms_snapshot();
        let mut feeds = self.inner.gym_feeds.lock();
        feeds.retain(|tx| !tx.is_closed());
        for tx in feeds.iter() {
            tx.send_replace(FeedState::Ready(snapshot.clone()));
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn upsert_presence(&self, user_id: &str, patch: PresencePatch) -> Result<()> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::Database(
                "presence write rejected (injected failure)".to_string(),
            ));
        }

        let now = self.now();
        let existing = self.inner.presence.get(user_id).map(|r| r.value().clone());
        let record = patch.apply(user_id, existing, now);
        self.inner.presence.insert(user_id.to_string(), record);
        self.inner.presence_writes.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(user_id, is_active = patch.is_active, "Presence upserted");
        self.publish_presence();

        let ack_delay = *self.inner.write_ack_delay.lock();
        if let Some(delay) = ack_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn get_presence(&self, user_id: &str) -> Result<Option<PresenceRecord>> {
        Ok(self.inner.presence.get(user_id).map(|r| r.value().clone()))
    }

    fn subscribe_presence(&self, filter: PresenceFilter) -> Feed<Vec<PresenceRecord>> {
        let (tx, feed) = Feed::channel();
        tx.send_replace(FeedState::Ready(self.presence_snapshot(&filter)));
        self.inner.presence_feeds.lock().push((filter, tx));
        feed
    }

    fn subscribe_gyms(&self) -> Feed<Vec<Gym>> {
        let (tx, feed) = Feed::channel();
        tx.send_replace(FeedState::Ready(self.gyms_snapshot()));
        self.inner.gym_feeds.lock().push(tx);
        feed
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.inner.users.get(user_id).map(|u| u.value().clone()))
    }

    async fn set_auto_presence_enabled(&self, user_id: &str, enabled: bool) -> Result<()> {
        let mut user = self
            .inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;
        user.auto_presence_enabled = enabled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CrowdThresholds, Role};
    use chrono::TimeZone;

    fn gym(id: &str, name: &str) -> Gym {
        Gym {
            id: id.to_string(),
            name: name.to_string(),
            address: String::new(),
            latitude: Some(51.5),
            longitude: Some(-0.1),
            crowd_thresholds: CrowdThresholds::default(),
        }
    }

    #[tokio::test]
    async fn test_upsert_merges_and_stamps() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap();
        store.set_clock(Some(t0));

        store
            .upsert_presence("u1", PresencePatch::check_in("oxford"))
            .await
            .unwrap();
        let rec = store.get_presence("u1").await.unwrap().unwrap();
        assert_eq!(rec.gym_id.as_deref(), Some("oxford"));
        assert!(rec.is_active);
        assert_eq!(rec.last_seen, t0);

        let t1 = t0 + chrono::Duration::minutes(1);
        store.set_clock(Some(t1));
        store
            .upsert_presence("u1", PresencePatch::clear())
            .await
            .unwrap();
        let rec = store.get_presence("u1").await.unwrap().unwrap();
        assert_eq!(rec.gym_id.as_deref(), Some("oxford"));
        assert!(!rec.is_active);
        assert_eq!(rec.last_seen, t1);
        assert_eq!(store.presence_write_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let err = store
            .upsert_presence("u1", PresencePatch::check_in("oxford"))
            .await;
        assert!(matches!(err, Err(AppError::Database(_))));
        assert_eq!(store.presence_write_count(), 0);
        assert!(store.get_presence("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_presence_feed_filters_and_updates() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe_presence(PresenceFilter::active_at("oxford"));
        assert_eq!(feed.current(), FeedState::Ready(vec![]));

        store
            .upsert_presence("u1", PresencePatch::check_in("oxford"))
            .await
            .unwrap();
        let state = feed.changed().await.unwrap();
        assert_eq!(state.ready().unwrap().len(), 1);

        // A write at another gym leaves this query's snapshot unchanged
        store
            .upsert_presence("u2", PresencePatch::check_in("soho"))
            .await
            .unwrap();
        assert_eq!(feed.current().ready().unwrap().len(), 1);

        store
            .upsert_presence("u1", PresencePatch::clear())
            .await
            .unwrap();
        let state = feed.changed().await.unwrap();
        assert!(state.ready().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_feeds_are_released() {
        let store = MemoryStore::with_gyms([gym("oxford", "MetroGym Oxford")]);
        let a = store.subscribe_presence(PresenceFilter::active());
        let b = store.subscribe_gyms();
        assert_eq!(store.live_subscriptions(), 2);

        drop(a);
        assert_eq!(store.live_subscriptions(), 1);
        drop(b);
        assert_eq!(store.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_gym_feed_sorted_by_name() {
        let store = MemoryStore::with_gyms([
            gym("soho", "MetroGym Soho"),
            gym("bank", "MetroGym Bank"),
        ]);
        let mut feed = store.subscribe_gyms();
        let ids: Vec<String> = feed
            .current()
            .ready()
            .unwrap()
            .iter()
            .map(|g| g.id.clone())
            .collect();
        assert_eq!(ids, vec!["bank", "soho"]);

        store.put_gym(gym("angel", "MetroGym Angel"));
        let state = feed.changed().await.unwrap();
        assert_eq!(state.ready().unwrap()[0].id, "angel");
    }

    #[tokio::test]
    async fn test_auto_presence_flag() {
        let store = MemoryStore::new();
        assert!(!store.get_auto_presence_enabled("u1").await.unwrap());
        assert!(store.set_auto_presence_enabled("u1", true).await.is_err());

        store.put_user(User {
            id: "u1".to_string(),
            display_name: None,
            email: None,
            primary_gym: Some("oxford".to_string()),
            auto_presence_enabled: false,
            role: Role::Member,
        });
        store.set_auto_presence_enabled("u1", true).await.unwrap();
        assert!(store.get_auto_presence_enabled("u1").await.unwrap());
    }
}
