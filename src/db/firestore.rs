// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore client wrapper with typed operations.
//!
//! Provides high-level operations for:
//! - Users (profile flags read by the presence controller)
//! - Gyms (coordinates and crowd thresholds)
//! - User presence (one merge-written document per user)
//!
//! Documents are converted to typed models at this boundary; nothing above
//! it sees raw Firestore maps. Query subscriptions are backed by realtime
//! listeners and only push when the result set changes.

use crate::db::{collections, DocumentStore, Feed, FeedSender, FeedState};
use crate::error::{AppError, Result};
use crate::models::{CrowdThresholds, Gym, PresenceFilter, PresencePatch, PresenceRecord, Role, User};
use async_trait::async_trait;
use firestore::select_builder::FirestoreSelectDocBuilder;
use firestore::{FirestoreListenEvent, FirestoreListenerTarget, FirestoreMemListenStateStorage};
use gcloud_sdk::google::firestore::v1::Document;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Each feed owns its listener, so one target id is enough.
const LISTEN_TARGET: u32 = 1;

type Listener = firestore::FirestoreListener<firestore::FirestoreDb, FirestoreMemListenStateStorage>;
type ListenResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Firestore database client.
#[derive(Clone)]
pub struct FirestoreDb {
    client: Option<firestore::FirestoreDb>,
    retry_delay: Duration,
}

impl FirestoreDb {
    /// Create a new Firestore client.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str) -> Result<Self> {
        // If the emulator environment variable is set, use unauthenticated connection
        // to avoid local credential warnings and leakage.
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = firestore::FirestoreDb::new(project_id)
            .await
            .map_err(|e| AppError::Database(format!("Failed to connect to Firestore: {}", e)))?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self {
            client: Some(client),
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str) -> Result<Self> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                        .to_string()
                        .into(),
                ),
                expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| {
            AppError::Database(format!("Failed to connect to Firestore Emulator: {}", e))
        })?;

        tracing::info!(
            project = project_id,
            "Connected to Firestore (Emulator/Unauthenticated)"
        );

        Ok(Self {
            client: Some(client),
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    /// Create a mock Firestore client for testing (offline mode).
    ///
    /// All database operations will return an error if called, and every
    /// subscription reports a failed feed.
    pub fn new_mock() -> Self {
        Self {
            client: None,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Set how long a dropped listener waits before reconnecting.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Helper to get the client or return an error if offline.
    fn get_client(&self) -> Result<&firestore::FirestoreDb> {
        self.client
            .as_ref()
            .ok_or_else(|| AppError::Database("Database not connected (offline mode)".to_string()))
    }

    // ─── Gym Operations ──────────────────────────────────────────

    /// List all gyms, ordered by name.
    pub async fn list_gyms(&self) -> Result<Vec<Gym>> {
        let docs: Vec<GymDoc> = self
            .get_client()?
            .fluent()
            .select()
            .from(collections::GYMS)
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        let mut gyms: Vec<Gym> = docs.into_iter().filter_map(GymDoc::into_gym).collect();
        sort_gyms(&mut gyms);
        Ok(gyms)
    }

    /// Create or replace a gym document (seeding and admin tooling).
    pub async fn upsert_gym(&self, gym: &Gym) -> Result<()> {
        let doc = GymDoc::from_gym(gym);
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collections::GYMS)
            .document_id(&gym.id)
            .object(&doc)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    // ─── User Operations ─────────────────────────────────────────

    /// Create or replace a user profile document.
    pub async fn upsert_user(&self, user: &User) -> Result<()> {
        let doc = UserDoc::from_user(user);
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collections::USERS)
            .document_id(&user.id)
            .object(&doc)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    // ─── Presence Operations ─────────────────────────────────────

    /// Query presence documents matching a filter, sorted by user id.
    pub async fn query_presence(&self, filter: &PresenceFilter) -> Result<Vec<PresenceRecord>> {
        let docs: Vec<PresenceDoc> = presence_query(self.get_client()?, filter)
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        let mut records: Vec<PresenceRecord> =
            docs.into_iter().map(PresenceDoc::into_record).collect();
        sort_presence(&mut records);
        Ok(records)
    }

    /// Start a realtime query feeding a new feed.
    ///
    /// `initial` seeds the snapshot; listener events are applied on top of
    /// it. The listener is shut down once the last receiver is dropped.
    fn spawn_live_query<T, I, Fut, A>(
        &self,
        shape: LiveShape<T>,
        initial: I,
        add_target: A,
    ) -> Feed<Vec<T>>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        I: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
        A: FnOnce(&firestore::FirestoreDb, &mut Listener) -> firestore::FirestoreResult<()>
            + Send
            + 'static,
    {
        let (tx, feed) = Feed::channel();
        let client = match self.get_client() {
            Ok(client) => client.clone(),
            Err(e) => {
                tx.send_replace(FeedState::Failed(e.to_string()));
                return feed;
            }
        };

        let what = shape.what;
        let live = Arc::new(LiveQuery {
            shape,
            docs: parking_lot::Mutex::new(BTreeMap::new()),
            tx,
        });
        let retry_delay = self.retry_delay;

        tokio::spawn(async move {
            let mut listener = match start_listener(&client, retry_delay, &live, initial, add_target).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!(feed = what, error = %e, "Subscription failed to start");
                    live.tx.send_replace(FeedState::Failed(e.to_string()));
                    return;
                }
            };

            live.tx.closed().await;
            if let Err(e) = listener.shutdown().await {
                tracing::warn!(feed = what, error = %e, "Listener shutdown failed");
            }
            tracing::debug!(feed = what, "Subscription closed");
        });

        feed
    }
}

/// Seed the snapshot, then attach a listener that keeps it current.
async fn start_listener<T, I, Fut, A>(
    client: &firestore::FirestoreDb,
    retry_delay: Duration,
    live: &Arc<LiveQuery<T>>,
    initial: I,
    add_target: A,
) -> Result<Listener>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    I: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
    A: FnOnce(&firestore::FirestoreDb, &mut Listener) -> firestore::FirestoreResult<()>,
{
    let to_app = |e: firestore::errors::FirestoreError| AppError::Database(e.to_string());

    let mut listener = client
        .create_listener_with_params(
            FirestoreMemListenStateStorage::new(),
            firestore::FirestoreListenerParams::new().with_retry_delay(retry_delay),
        )
        .await
        .map_err(to_app)?;
    add_target(client, &mut listener).map_err(to_app)?;

    live.reset(initial().await?);

    let events = live.clone();
    listener
        .start(move |event| {
            let events = events.clone();
            async move {
                events.apply(event);
                ListenResult::Ok(())
            }
        })
        .await
        .map_err(to_app)?;

    Ok(listener)
}

/// Presence documents matching `filter`, ready to query or listen on.
fn presence_query<'a>(
    client: &'a firestore::FirestoreDb,
    filter: &PresenceFilter,
) -> FirestoreSelectDocBuilder<'a, firestore::FirestoreDb> {
    let gym_id = filter.gym_id.clone();
    let is_active = filter.is_active;

    client
        .fluent()
        .select()
        .from(collections::USER_PRESENCE)
        .filter(move |q| {
            q.for_all([
                gym_id.as_ref().and_then(|g| q.field("gymId").eq(g.as_str())),
                is_active.and_then(|a| q.field("isActive").eq(a)),
            ])
        })
}

fn presence_key(record: &PresenceRecord) -> &str {
    &record.user_id
}

fn gym_key(gym: &Gym) -> &str {
    &gym.id
}

fn sort_presence(records: &mut [PresenceRecord]) {
    records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
}

fn sort_gyms(gyms: &mut [Gym]) {
    gyms.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
}

/// Last path segment of a full document name.
fn document_id(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// How one kind of document becomes a feed snapshot.
struct LiveShape<T> {
    what: &'static str,
    decode: fn(&Document) -> Option<T>,
    key: fn(&T) -> &str,
    arrange: fn(&mut [T]),
}

/// Snapshot of a realtime query, keyed by document id.
struct LiveQuery<T> {
    shape: LiveShape<T>,
    docs: parking_lot::Mutex<BTreeMap<String, T>>,
    tx: FeedSender<Vec<T>>,
}

impl<T> LiveQuery<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn reset(&self, values: Vec<T>) {
        let mut docs = self.docs.lock();
        docs.clear();
        for value in values {
            docs.insert((self.shape.key)(&value).to_string(), value);
        }
        self.publish(&docs);
    }

    fn apply(&self, event: FirestoreListenEvent) {
        let mut docs = self.docs.lock();
        match event {
            FirestoreListenEvent::DocumentChange(change) => {
                let Some(doc) = change.document else {
                    return;
                };
                let id = document_id(&doc.name).to_string();
                // Empty target list: the document no longer matches the query
                let value = if change.target_ids.is_empty() {
                    None
                } else {
                    (self.shape.decode)(&doc)
                };
                match value {
                    Some(value) => docs.insert(id, value),
                    None => docs.remove(&id),
                };
            }
            FirestoreListenEvent::DocumentDelete(delete) => {
                docs.remove(document_id(&delete.document));
            }
            FirestoreListenEvent::DocumentRemove(remove) => {
                docs.remove(document_id(&remove.document));
            }
            _ => return,
        }
        self.publish(&docs);
    }

    fn publish(&self, docs: &BTreeMap<String, T>) {
        let mut values: Vec<T> = docs.values().cloned().collect();
        (self.shape.arrange)(&mut values);
        let next = FeedState::Ready(values);
        self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

fn decode_presence(doc: &Document) -> Option<PresenceRecord> {
    firestore::FirestoreDb::deserialize_doc_to::<PresenceDoc>(doc)
        .inspect_err(|e| tracing::warn!(doc = %doc.name, error = %e, "Unreadable presence document"))
        .ok()
        .map(PresenceDoc::into_record)
}

fn decode_gym(doc: &Document) -> Option<Gym> {
    firestore::FirestoreDb::deserialize_doc_to::<GymDoc>(doc)
        .inspect_err(|e| tracing::warn!(doc = %doc.name, error = %e, "Unreadable gym document"))
        .ok()
        .and_then(GymDoc::into_gym)
}

#[async_trait]
impl DocumentStore for FirestoreDb {
    async fn upsert_presence(&self, user_id: &str, patch: PresencePatch) -> Result<()> {
        let doc = PresenceDoc {
            user_id: user_id.to_string(),
            gym_id: patch.gym_id.clone(),
            is_active: patch.is_active,
            last_seen: chrono::Utc::now(),
        };

        // Field mask gives merge semantics: a clear leaves gymId alone.
        let fields: &[&str] = if patch.gym_id.is_some() {
            &["userId", "gymId", "isActive", "lastSeen"]
        } else {
            &["userId", "isActive", "lastSeen"]
        };

        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .fields(fields.iter().copied())
            .in_col(collections::USER_PRESENCE)
            .document_id(user_id)
            .object(&doc)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_presence(&self, user_id: &str) -> Result<Option<PresenceRecord>> {
        let doc: Option<PresenceDoc> = self
            .get_client()?
            .fluent()
            .select()
            .by_id_in(collections::USER_PRESENCE)
            .obj()
            .one(user_id)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(doc.map(PresenceDoc::into_record))
    }

    fn subscribe_presence(&self, filter: PresenceFilter) -> Feed<Vec<PresenceRecord>> {
        let db = self.clone();
        let initial_filter = filter.clone();
        self.spawn_live_query(
            LiveShape {
                what: "presence",
                decode: decode_presence,
                key: presence_key,
                arrange: sort_presence,
            },
            move || async move { db.query_presence(&initial_filter).await },
            move |client, listener| {
                presence_query(client, &filter)
                    .listen()
                    .add_target(FirestoreListenerTarget::new(LISTEN_TARGET), listener)
            },
        )
    }

    fn subscribe_gyms(&self) -> Feed<Vec<Gym>> {
        let db = self.clone();
        self.spawn_live_query(
            LiveShape {
                what: "gyms",
                decode: decode_gym,
                key: gym_key,
                arrange: sort_gyms,
            },
            move || async move { db.list_gyms().await },
            |client, listener| {
                client
                    .fluent()
                    .select()
                    .from(collections::GYMS)
                    .listen()
                    .add_target(FirestoreListenerTarget::new(LISTEN_TARGET), listener)
            },
        )
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let doc: Option<UserDoc> = self
            .get_client()?
            .fluent()
            .select()
            .by_id_in(collections::USERS)
            .obj()
            .one(user_id)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(doc.map(|d| d.into_user(user_id)))
    }

    async fn set_auto_presence_enabled(&self, user_id: &str, enabled: bool) -> Result<()> {
        let existing: Option<UserDoc> = self
            .get_client()?
            .fluent()
            .select()
            .by_id_in(collections::USERS)
            .obj()
            .one(user_id)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        let mut doc =
            existing.ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;
        doc.auto_presence_enabled = enabled;

        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .fields(["autoPresenceEnabled"])
            .in_col(collections::USERS)
            .document_id(user_id)
            .object(&doc)
            .execute()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(())
    }
}

// ─── Document shapes ─────────────────────────────────────────────

/// `userPresence/{userId}` as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresenceDoc {
    user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gym_id: Option<String>,
    is_active: bool,
    #[serde(with = "firestore::serialize_as_timestamp")]
    last_seen: chrono::DateTime<chrono::Utc>,
}

impl PresenceDoc {
    fn into_record(self) -> PresenceRecord {
        PresenceRecord {
            user_id: self.user_id,
            gym_id: self.gym_id,
            is_active: self.is_active,
            last_seen: self.last_seen,
        }
    }
}

/// `gyms/{gymId}` as stored by the admin console.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GymDoc {
    #[serde(alias = "_firestore_id")]
    id: Option<String>,
    gym_name: String,
    #[serde(default)]
    address: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    threshold_low: Option<u32>,
    threshold_moderate: Option<u32>,
    threshold_packed: Option<u32>,
}

impl GymDoc {
    fn from_gym(gym: &Gym) -> Self {
        Self {
            id: Some(gym.id.clone()),
            gym_name: gym.name.clone(),
            address: gym.address.clone(),
            latitude: gym.latitude,
            longitude: gym.longitude,
            threshold_low: Some(gym.crowd_thresholds.low),
            threshold_moderate: Some(gym.crowd_thresholds.moderate),
            threshold_packed: Some(gym.crowd_thresholds.packed),
        }
    }

    fn into_gym(self) -> Option<Gym> {
        let Some(id) = self.id else {
            tracing::warn!(name = %self.gym_name, "Gym document without id, skipping");
            return None;
        };
        let defaults = CrowdThresholds::default();
        Some(Gym {
            id,
            name: self.gym_name,
            address: self.address,
            latitude: self.latitude,
            longitude: self.longitude,
            crowd_thresholds: CrowdThresholds {
                low: self.threshold_low.unwrap_or(defaults.low),
                moderate: self.threshold_moderate.unwrap_or(defaults.moderate),
                packed: self.threshold_packed.unwrap_or(defaults.packed),
            },
        })
    }
}

/// `users/{userId}` as stored by signup and profile edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserDoc {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    primary_gym: Option<String>,
    #[serde(default)]
    auto_presence_enabled: bool,
    #[serde(default)]
    role: Option<String>,
}

impl UserDoc {
    fn from_user(user: &User) -> Self {
        Self {
            display_name: user.display_name.clone(),
            email: user.email.clone(),
            primary_gym: user.primary_gym.clone(),
            auto_presence_enabled: user.auto_presence_enabled,
            role: user.is_admin().then(|| "admin".to_string()),
        }
    }

    fn into_user(self, user_id: &str) -> User {
        let role = match self.role.as_deref() {
            Some("admin") => Role::Admin,
            _ => Role::Member,
        };
        User {
            id: user_id.to_string(),
            display_name: self.display_name,
            email: self.email,
            // Empty string is how the signup form stores "none selected"
            primary_gym: self.primary_gym.filter(|g| !g.is_empty()),
            auto_presence_enabled: self.auto_presence_enabled,
            role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gym_doc_defaults_thresholds() {
        let doc: GymDoc = serde_json::from_value(serde_json::json!({
            "id": "oxford",
            "gymName": "MetroGym Oxford",
            "latitude": 51.5154,
            "longitude": -0.141,
            "thresholdPacked": 120
        }))
        .unwrap();
        let gym = doc.into_gym().unwrap();
        assert_eq!(gym.id, "oxford");
        assert_eq!(gym.crowd_thresholds.low, 20);
        assert_eq!(gym.crowd_thresholds.packed, 120);
        assert_eq!(gym.address, "");
    }

    #[test]
    fn test_gym_doc_without_id_skipped() {
        let doc: GymDoc = serde_json::from_value(serde_json::json!({
            "gymName": "Nameless"
        }))
        .unwrap();
        assert!(doc.into_gym().is_none());
    }

    #[test]
    fn test_user_doc_conversion() {
        let doc: UserDoc = serde_json::from_value(serde_json::json!({
            "displayName": "Ada",
            "primaryGym": "",
            "role": "admin"
        }))
        .unwrap();
        let user = doc.into_user("u1");
        assert_eq!(user.id, "u1");
        assert_eq!(user.primary_gym, None);
        assert!(user.is_admin());
        assert!(!user.auto_presence_enabled);
    }

    #[tokio::test]
    async fn test_offline_feed_reports_failure() {
        let db = FirestoreDb::new_mock();
        let feed = db.subscribe_presence(PresenceFilter::active());
        assert!(matches!(feed.current(), FeedState::Failed(_)));
        assert!(matches!(db.subscribe_gyms().current(), FeedState::Failed(_)));
    }

    #[test]
    fn test_presence_doc_conversion() {
        let doc: PresenceDoc = serde_json::from_value(serde_json::json!({
            "userId": "u1",
            "isActive": false,
            "lastSeen": "2026-03-01T18:00:00Z"
        }))
        .unwrap();
        let record = doc.into_record();
        assert_eq!(record.user_id, "u1");
        assert_eq!(record.gym_id, None);
        assert!(!record.is_active);
        assert_eq!(record.last_seen.to_rfc3339(), "2026-03-01T18:00:00+00:00");
    }

    #[test]
    fn test_document_id_from_name() {
        assert_eq!(
            document_id("projects/p/databases/(default)/documents/userPresence/u1"),
            "u1"
        );
        assert_eq!(document_id("u1"), "u1");
    }

    fn gym_named(id: &str, name: &str) -> Gym {
        Gym {
            id: id.to_string(),
            name: name.to_string(),
            address: String::new(),
            latitude: None,
            longitude: None,
            crowd_thresholds: CrowdThresholds::default(),
        }
    }

    #[tokio::test]
    async fn test_live_query_applies_changes() {
        let (tx, feed) = Feed::channel();
        let live = LiveQuery {
            shape: LiveShape {
                what: "gyms",
                decode: decode_gym,
                key: gym_key,
                arrange: sort_gyms,
            },
            docs: parking_lot::Mutex::new(BTreeMap::new()),
            tx,
        };

        live.reset(vec![gym_named("soho", "MetroGym Soho"), gym_named("bank", "MetroGym Bank")]);
        let ids: Vec<String> = feed.current().ready().unwrap().iter().map(|g| g.id.clone()).collect();
        assert_eq!(ids, vec!["bank", "soho"]);

        live.apply(FirestoreListenEvent::DocumentRemove(
            gcloud_sdk::google::firestore::v1::DocumentRemove {
                document: "projects/p/databases/(default)/documents/gyms/soho".to_string(),
                ..Default::default()
            },
        ));
        let ids: Vec<String> = feed.current().ready().unwrap().iter().map(|g| g.id.clone()).collect();
        assert_eq!(ids, vec!["bank"]);
    }

    #[tokio::test]
    async fn test_offline_writes_fail() {
        let db = FirestoreDb::new_mock();
        let result = db
            .upsert_presence("u1", PresencePatch::check_in("oxford"))
            .await;
        assert!(matches!(result, Err(AppError::Database(_))));
    }
}
