//! Result handoff: moves recorded results to the external sink, retrying
//! until each one is acknowledged.
//!
//! The router hands a result off inline once its reply has settled; the
//! background task picks up whatever that missed. Both go through one
//! [`ResultHandoff`], which lets a given result be in flight only once.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::model::{AssessmentResult, ResultKey};
use super::sink::ResultSink;
use super::store::ResultStore;
use crate::dispatch::redact_phone;
use crate::error::SinkError;

/// Results fetched per handoff pass.
const HANDOFF_BATCH: usize = 50;

/// How long a result may wait for its reply to settle before the background
/// pass hands it off with whatever delivery status it has.
pub const UNSETTLED_DELIVERY_GRACE: Duration = Duration::from_secs(600);

/// What happened to one handoff request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffOutcome {
    HandedOff,
    /// Already acknowledged, or another handoff for it is in flight.
    Skipped,
}

pub struct ResultHandoff {
    store: Arc<dyn ResultStore>,
    sink: Arc<dyn ResultSink>,
    escalate_after: u32,
    grace: chrono::Duration,
    in_flight: Mutex<HashSet<String>>,
}

/// Releases an in-flight claim on drop.
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.key);
        }
    }
}

impl ResultHandoff {
    pub fn new(store: Arc<dyn ResultStore>, sink: Arc<dyn ResultSink>, escalate_after: u32) -> Self {
        Self {
            store,
            sink,
            escalate_after,
            grace: chrono::Duration::from_std(UNSETTLED_DELIVERY_GRACE)
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, key: &ResultKey) -> Option<Claim<'_>> {
        let key = key.to_string();
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(key.clone()) {
            return None;
        }
        Some(Claim {
            in_flight: &self.in_flight,
            key,
        })
    }

    /// Hand off a single result and record the outcome in the store.
    pub async fn hand_off_one(
        &self,
        result: &AssessmentResult,
    ) -> Result<HandoffOutcome, SinkError> {
        let key = result.key();
        let Some(_claim) = self.claim(&key) else {
            debug!(key = %key, "Result handoff already in flight");
            return Ok(HandoffOutcome::Skipped);
        };
        if self.store.is_handed_off(&key).await? {
            debug!(key = %key, "Result already handed off");
            return Ok(HandoffOutcome::Skipped);
        }

        match self.sink.hand_off(result).await {
            Ok(()) => {
                self.store.mark_handed_off(&key).await?;
                info!(
                    phone = %redact_phone(&result.phone),
                    instrument = %result.instrument_id,
                    delivery = result.delivery_status.as_str(),
                    "Assessment result handed off"
                );
                Ok(HandoffOutcome::HandedOff)
            }
            Err(e) => {
                let attempts = self.store.record_handoff_failure(&key, &e.to_string()).await?;
                if attempts >= self.escalate_after {
                    error!(
                        phone = %redact_phone(&result.phone),
                        instrument = %result.instrument_id,
                        attempts,
                        error = %e,
                        "Assessment result handoff keeps failing; operator attention required"
                    );
                } else {
                    warn!(
                        phone = %redact_phone(&result.phone),
                        instrument = %result.instrument_id,
                        attempts,
                        error = %e,
                        "Assessment result handoff failed, will retry"
                    );
                }
                Err(e)
            }
        }
    }

    /// Retry every pending handoff once. Returns the number handed off.
    pub async fn hand_off_pending(&self) -> Result<usize, SinkError> {
        let pending = self
            .store
            .pending_handoffs(Utc::now() - self.grace, HANDOFF_BATCH)
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }
        debug!(count = pending.len(), "Retrying pending result handoffs");

        let mut handed_off = 0;
        for item in pending {
            if let Ok(HandoffOutcome::HandedOff) = self.hand_off_one(&item.result).await {
                handed_off += 1;
            }
        }
        Ok(handed_off)
    }

    /// Spawn a background task that periodically retries pending handoffs.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.hand_off_pending().await {
                    error!(error = %e, "Result handoff pass failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::results::model::DeliveryStatus;
    use crate::results::store::MemoryResultStore;

    #[derive(Default)]
    struct FlakySink {
        down: AtomicBool,
        received: Mutex<Vec<AssessmentResult>>,
    }

    #[async_trait]
    impl ResultSink for FlakySink {
        async fn hand_off(&self, result: &AssessmentResult) -> Result<(), SinkError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(SinkError::Rejected {
                    status: 503,
                    body: "maintenance".into(),
                });
            }
            self.received.lock().unwrap().push(result.clone());
            Ok(())
        }
    }

    fn result(status: DeliveryStatus) -> AssessmentResult {
        let now = Utc::now();
        AssessmentResult {
            phone: "+15550001111".into(),
            instrument_id: "gad7".into(),
            answers: vec![3; 7],
            total_score: 21,
            category: "severe".into(),
            started_at: now,
            completed_at: now,
            delivery_status: status,
        }
    }

    fn setup() -> (Arc<MemoryResultStore>, Arc<FlakySink>, ResultHandoff) {
        let store = Arc::new(MemoryResultStore::new());
        let sink = Arc::new(FlakySink::default());
        let handoff = ResultHandoff::new(store.clone(), sink.clone(), 3);
        (store, sink, handoff)
    }

    #[tokio::test]
    async fn failed_handoff_stays_pending_until_sink_recovers() {
        let (store, sink, handoff) = setup();
        sink.down.store(true, Ordering::SeqCst);
        let r = result(DeliveryStatus::Sent);
        store.record_result(&r).await.unwrap();

        assert!(handoff.hand_off_one(&r).await.is_err());
        assert_eq!(handoff.hand_off_pending().await.unwrap(), 0);
        let pending = store.pending_handoffs(Utc::now(), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 2);

        sink.down.store(false, Ordering::SeqCst);
        assert_eq!(handoff.hand_off_pending().await.unwrap(), 1);
        assert!(store.pending_handoffs(Utc::now(), 10).await.unwrap().is_empty());
        assert_eq!(sink.received.lock().unwrap().len(), 1);

        // Nothing left to send on the next pass.
        assert_eq!(handoff.hand_off_pending().await.unwrap(), 0);
        assert_eq!(sink.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn acknowledged_result_is_not_sent_again() {
        let (store, sink, handoff) = setup();
        let r = result(DeliveryStatus::Sent);
        store.record_result(&r).await.unwrap();

        assert_eq!(handoff.hand_off_one(&r).await.unwrap(), HandoffOutcome::HandedOff);
        assert_eq!(handoff.hand_off_one(&r).await.unwrap(), HandoffOutcome::Skipped);
        assert_eq!(sink.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn background_pass_waits_for_reply_to_settle() {
        let (store, sink, handoff) = setup();
        let r = result(DeliveryStatus::Pending);
        store.record_result(&r).await.unwrap();

        assert_eq!(handoff.hand_off_pending().await.unwrap(), 0);
        assert!(sink.received.lock().unwrap().is_empty());

        store
            .set_delivery_status(&r.key(), DeliveryStatus::Failed)
            .await
            .unwrap();
        assert_eq!(handoff.hand_off_pending().await.unwrap(), 1);
        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].delivery_status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn in_flight_result_is_skipped() {
        let (store, sink, handoff) = setup();
        let r = result(DeliveryStatus::Sent);
        store.record_result(&r).await.unwrap();

        let claim = handoff.claim(&r.key());
        assert!(claim.is_some());
        assert_eq!(handoff.hand_off_one(&r).await.unwrap(), HandoffOutcome::Skipped);
        drop(claim);
        assert_eq!(handoff.hand_off_one(&r).await.unwrap(), HandoffOutcome::HandedOff);
        assert_eq!(sink.received.lock().unwrap().len(), 1);
    }
}
