//! Session store capability: the only owner of session mutation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::model::ConversationSession;
use crate::error::DatabaseError;

/// Durable, phone-keyed session storage with compare-and-swap writes.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the session for a phone number.
    async fn get(&self, phone: &str) -> Result<Option<ConversationSession>, DatabaseError>;

    /// Write `session` only if the stored version still equals
    /// `expected_version` (0 = no row yet). On success the stored version
    /// becomes `expected_version + 1`. Returns false on a version mismatch.
    async fn put_if_unchanged(
        &self,
        session: &ConversationSession,
        expected_version: u64,
    ) -> Result<bool, DatabaseError>;

    /// Sessions in an awaiting state last updated before `before`.
    async fn list_stale(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<ConversationSession>, DatabaseError>;
}

/// In-process session store.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, ConversationSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, phone: &str) -> Result<Option<ConversationSession>, DatabaseError> {
        Ok(self.sessions.read().await.get(phone).cloned())
    }

    async fn put_if_unchanged(
        &self,
        session: &ConversationSession,
        expected_version: u64,
    ) -> Result<bool, DatabaseError> {
        let mut sessions = self.sessions.write().await;
        let current = sessions.get(&session.phone).map_or(0, |s| s.version);
        if current != expected_version {
            debug!(
                expected = expected_version,
                current, "Session version mismatch, write rejected"
            );
            return Ok(false);
        }

        let mut stored = session.clone();
        stored.version = expected_version + 1;
        sessions.insert(stored.phone.clone(), stored);
        Ok(true)
    }

    async fn list_stale(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<ConversationSession>, DatabaseError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.status.is_awaiting() && s.updated_at < before)
            .cloned()
            .collect())
    }
}
