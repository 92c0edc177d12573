//! Result outbox: durable record of every completed questionnaire until the
//! external sink has acknowledged it.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::model::{AssessmentResult, DeliveryStatus, ResultKey};
use crate::error::DatabaseError;

/// A result not yet acknowledged by the sink.
#[derive(Debug, Clone)]
pub struct PendingHandoff {
    pub result: AssessmentResult,
    /// Failed handoff attempts so far.
    pub attempts: u32,
}

/// Storage for assessment results, idempotent on [`ResultKey`].
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert a result. Returns false (and changes nothing) if a result with
    /// the same key already exists.
    async fn record_result(&self, result: &AssessmentResult) -> Result<bool, DatabaseError>;

    async fn get_result(&self, key: &ResultKey) -> Result<Option<AssessmentResult>, DatabaseError>;

    /// All results for a phone, oldest first.
    async fn results_for_phone(&self, phone: &str)
    -> Result<Vec<AssessmentResult>, DatabaseError>;

    async fn set_delivery_status(
        &self,
        key: &ResultKey,
        status: DeliveryStatus,
    ) -> Result<(), DatabaseError>;

    /// Results not yet handed off, oldest first. A result whose reply is
    /// still being delivered is held back unless it completed before
    /// `unsettled_before`.
    async fn pending_handoffs(
        &self,
        unsettled_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingHandoff>, DatabaseError>;

    async fn is_handed_off(&self, key: &ResultKey) -> Result<bool, DatabaseError>;

    async fn mark_handed_off(&self, key: &ResultKey) -> Result<(), DatabaseError>;

    /// Count a failed handoff. Returns the new attempt count.
    async fn record_handoff_failure(
        &self,
        key: &ResultKey,
        error: &str,
    ) -> Result<u32, DatabaseError>;
}

struct Entry {
    seq: u64,
    result: AssessmentResult,
    handed_off: bool,
    attempts: u32,
    last_error: Option<String>,
}

/// In-process result store.
#[derive(Default)]
pub struct MemoryResultStore {
    entries: RwLock<HashMap<ResultKey, Entry>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Last recorded handoff error for a key.
    pub async fn last_error(&self, key: &ResultKey) -> Option<String> {
        self.entries
            .read()
            .await
            .get(key)
            .and_then(|e| e.last_error.clone())
    }
}

fn not_found(key: &ResultKey) -> DatabaseError {
    DatabaseError::NotFound {
        entity: "assessment_result".into(),
        id: key.to_string(),
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn record_result(&self, result: &AssessmentResult) -> Result<bool, DatabaseError> {
        let mut entries = self.entries.write().await;
        let key = result.key();
        if entries.contains_key(&key) {
            return Ok(false);
        }
        let seq = entries.len() as u64;
        entries.insert(
            key,
            Entry {
                seq,
                result: result.clone(),
                handed_off: false,
                attempts: 0,
                last_error: None,
            },
        );
        Ok(true)
    }

    async fn get_result(&self, key: &ResultKey) -> Result<Option<AssessmentResult>, DatabaseError> {
        Ok(self.entries.read().await.get(key).map(|e| e.result.clone()))
    }

    async fn results_for_phone(
        &self,
        phone: &str,
    ) -> Result<Vec<AssessmentResult>, DatabaseError> {
        let entries = self.entries.read().await;
        let mut matching: Vec<&Entry> = entries
            .values()
            .filter(|e| e.result.phone == phone)
            .collect();
        matching.sort_by_key(|e| e.seq);
        Ok(matching.into_iter().map(|e| e.result.clone()).collect())
    }

    async fn set_delivery_status(
        &self,
        key: &ResultKey,
        status: DeliveryStatus,
    ) -> Result<(), DatabaseError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(key).ok_or_else(|| not_found(key))?;
        entry.result.delivery_status = status;
        Ok(())
    }

    async fn pending_handoffs(
        &self,
        unsettled_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingHandoff>, DatabaseError> {
        let entries = self.entries.read().await;
        let mut pending: Vec<&Entry> = entries
            .values()
            .filter(|e| !e.handed_off)
            .filter(|e| {
                e.result.delivery_status != DeliveryStatus::Pending
                    || e.result.completed_at < unsettled_before
            })
            .collect();
        pending.sort_by_key(|e| e.seq);
        Ok(pending
            .into_iter()
            .take(limit)
            .map(|e| PendingHandoff {
                result: e.result.clone(),
                attempts: e.attempts,
            })
            .collect())
    }

    async fn is_handed_off(&self, key: &ResultKey) -> Result<bool, DatabaseError> {
        let entries = self.entries.read().await;
        let entry = entries.get(key).ok_or_else(|| not_found(key))?;
        Ok(entry.handed_off)
    }

    async fn mark_handed_off(&self, key: &ResultKey) -> Result<(), DatabaseError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(key).ok_or_else(|| not_found(key))?;
        entry.handed_off = true;
        entry.last_error = None;
        Ok(())
    }

    async fn record_handoff_failure(
        &self,
        key: &ResultKey,
        error: &str,
    ) -> Result<u32, DatabaseError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(key).ok_or_else(|| not_found(key))?;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        Ok(entry.attempts)
    }
}
