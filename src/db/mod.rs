//! Database layer.
//!
//! The presence core only talks to [`DocumentStore`]. Two adapters exist:
//! [`FirestoreDb`] for production and [`MemoryStore`] for local runs and tests.

pub mod feed;
pub mod firestore;
pub mod memory;

pub use feed::{Feed, FeedSender, FeedState, SubscriptionHandle};
pub use firestore::FirestoreDb;
pub use memory::MemoryStore;

use crate::error::Result;
use crate::models::{Gym, PresenceFilter, PresencePatch, PresenceRecord, User};
use async_trait::async_trait;

/// Collection names as constants.
pub mod collections {
    pub const USERS: &str = "users";
    pub const GYMS: &str = "gyms";
    /// One document per user, keyed by user id
    pub const USER_PRESENCE: &str = "userPresence";
}

/// Operations the presence core needs from the document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Merge `patch` into the user's presence document, creating it if
    /// absent. The store assigns `last_seen`.
    async fn upsert_presence(&self, user_id: &str, patch: PresencePatch) -> Result<()>;

    async fn get_presence(&self, user_id: &str) -> Result<Option<PresenceRecord>>;

    /// Realtime feed of presence documents matching `filter`.
    fn subscribe_presence(&self, filter: PresenceFilter) -> Feed<Vec<PresenceRecord>>;

    /// Realtime feed of all gyms.
    fn subscribe_gyms(&self) -> Feed<Vec<Gym>>;

    async fn get_user(&self, user_id: &str) -> Result<Option<User>>;

    async fn get_auto_presence_enabled(&self, user_id: &str) -> Result<bool> {
        Ok(self
            .get_user(user_id)
            .await?
            .map(|u| u.auto_presence_enabled)
            .unwrap_or(false))
    }

    async fn set_auto_presence_enabled(&self, user_id: &str, enabled: bool) -> Result<()>;
}
