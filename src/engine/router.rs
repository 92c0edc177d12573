//! Inbound router: takes a raw event from the webhook to a persisted
//! transition, then delivers the replies.
//!
//! Ordering per message:
//! 1. normalize, mark in the dedupe cache
//! 2. under the phone lock: load session, run the state machine, record any
//!    result, compare-and-swap the session
//! 3. outside the lock: dispatch replies, update delivery status, hand off
//!
//! Delivery failures never roll back step 2.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::machine::{ConversationEngine, TransitionKind};
use crate::dispatch::{DeliveryOutcome, OutboundDispatcher, redact_phone};
use crate::error::{DatabaseError, Error, Result};
use crate::gateway::{DedupeCache, InboundMessage, normalize};
use crate::results::{AssessmentResult, DeliveryStatus, ResultHandoff, ResultStore};
use crate::session::{ConversationSession, PhoneLocks, SessionStore};

/// A message that was applied (or answered without mutation).
#[derive(Debug, Clone)]
pub struct Routed {
    pub phone: String,
    pub message_id: String,
    pub kind: TransitionKind,
    pub replies: Vec<String>,
    /// Set when this message completed a questionnaire.
    pub result: Option<AssessmentResult>,
}

#[derive(Debug, Clone)]
pub enum RouteOutcome {
    /// Already seen; nothing applied, nothing to send.
    Duplicate,
    Routed(Routed),
}

pub struct MessageRouter {
    engine: ConversationEngine,
    sessions: Arc<dyn SessionStore>,
    results: Arc<dyn ResultStore>,
    dispatcher: Arc<OutboundDispatcher>,
    dedupe: DedupeCache,
    locks: PhoneLocks,
    handoff: Option<Arc<ResultHandoff>>,
}

impl MessageRouter {
    pub fn new(
        engine: ConversationEngine,
        sessions: Arc<dyn SessionStore>,
        results: Arc<dyn ResultStore>,
        dispatcher: Arc<OutboundDispatcher>,
        dedupe: DedupeCache,
    ) -> Self {
        Self {
            engine,
            sessions,
            results,
            dispatcher,
            dedupe,
            locks: PhoneLocks::new(),
            handoff: None,
        }
    }

    /// Hand off completed results right after delivery settles.
    pub fn with_handoff(mut self, handoff: Arc<ResultHandoff>) -> Self {
        self.handoff = Some(handoff);
        self
    }

    pub fn engine(&self) -> &ConversationEngine {
        &self.engine
    }

    /// Normalize, deduplicate and apply one webhook body.
    pub async fn handle_event(
        &self,
        body: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<RouteOutcome> {
        let msg = match normalize(body, received_at) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Discarding malformed inbound event");
                return Err(e.into());
            }
        };

        if !self.dedupe.mark_seen(&msg.phone, &msg.message_id) {
            debug!(
                phone = %redact_phone(&msg.phone),
                message_id = %msg.message_id,
                "Duplicate inbound message dropped"
            );
            return Ok(RouteOutcome::Duplicate);
        }

        match self.apply(&msg).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Not applied, so a redelivery must be allowed through.
                self.dedupe.forget(&msg.phone, &msg.message_id);
                Err(e)
            }
        }
    }

    /// Apply a normalized message under the phone's lock.
    pub async fn apply(&self, msg: &InboundMessage) -> Result<RouteOutcome> {
        let _guard = self.locks.acquire(&msg.phone).await;

        let session = self
            .sessions
            .get(&msg.phone)
            .await?
            .unwrap_or_else(|| ConversationSession::idle(&msg.phone, msg.received_at));

        let transition = self.engine.apply(&session, msg);
        if transition.kind == TransitionKind::AlreadyApplied {
            debug!(
                phone = %redact_phone(&msg.phone),
                message_id = %msg.message_id,
                "Message already applied to session"
            );
            return Ok(RouteOutcome::Duplicate);
        }

        if transition.mutated() {
            let mut next = transition.session.clone();
            if let Some(ref result) = transition.result {
                if !self.results.record_result(result).await? {
                    debug!(key = %result.key(), "Assessment result already recorded");
                }
                next.rearm(msg.received_at);
            }

            if !self.sessions.put_if_unchanged(&next, session.version).await? {
                return Err(Error::Database(DatabaseError::Conflict {
                    entity: "conversation_session".into(),
                    id: redact_phone(&msg.phone),
                    expected: session.version,
                }));
            }
        }

        info!(
            phone = %redact_phone(&msg.phone),
            message_id = %msg.message_id,
            transition = ?transition.kind,
            step = transition.session.current_step,
            "Inbound message applied"
        );

        Ok(RouteOutcome::Routed(Routed {
            phone: msg.phone.clone(),
            message_id: msg.message_id.clone(),
            kind: transition.kind,
            replies: transition.replies,
            result: transition.result,
        }))
    }

    /// Send the replies for a routed message and settle any result.
    pub async fn deliver(&self, routed: &Routed) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::with_capacity(routed.replies.len());
        for reply in &routed.replies {
            outcomes.push(self.dispatcher.send(&routed.phone, reply).await);
        }

        let Some(ref result) = routed.result else {
            return outcomes;
        };

        let status = if outcomes.iter().all(DeliveryOutcome::is_sent) {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Failed
        };
        let key = result.key();
        if let Err(e) = self.results.set_delivery_status(&key, status).await {
            warn!(key = %key, error = %e, "Failed to record reply delivery status");
        }

        if let Some(ref handoff) = self.handoff {
            let mut settled = result.clone();
            settled.delivery_status = status;
            // Failures stay pending for the background handoff task.
            let _ = handoff.hand_off_one(&settled).await;
        }
        outcomes
    }

    /// Route and deliver in one call.
    pub async fn process(&self, body: &[u8], received_at: DateTime<Utc>) -> Result<RouteOutcome> {
        let outcome = self.handle_event(body, received_at).await?;
        if let RouteOutcome::Routed(ref routed) = outcome {
            self.deliver(routed).await;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::future::join_all;

    use super::*;
    use crate::config::DispatchConfig;
    use crate::dispatch::SmsTransport;
    use crate::error::{SinkError, TransportError};
    use crate::instruments::InstrumentRegistry;
    use crate::results::{MemoryResultStore, ResultSink};
    use crate::session::{MemorySessionStore, SessionStatus};

    const PHONE: &str = "+15550001111";

    #[derive(Default)]
    struct RecordingTransport {
        fail: AtomicBool,
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SmsTransport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, phone: &str, text: &str) -> std::result::Result<(), TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Status {
                    status: 400,
                    body: "rejected".into(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((phone.to_string(), text.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingSink {
        calls: AtomicU32,
        statuses: Mutex<Vec<DeliveryStatus>>,
    }

    #[async_trait]
    impl ResultSink for CountingSink {
        async fn hand_off(&self, result: &AssessmentResult) -> std::result::Result<(), SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.statuses.lock().unwrap().push(result.delivery_status);
            Ok(())
        }
    }

    /// Session store whose reads fail until `healthy` is set.
    struct BrokenSessionStore {
        healthy: AtomicBool,
        inner: MemorySessionStore,
    }

    #[async_trait]
    impl SessionStore for BrokenSessionStore {
        async fn get(
            &self,
            phone: &str,
        ) -> std::result::Result<Option<ConversationSession>, DatabaseError> {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(DatabaseError::Query("disk unavailable".into()));
            }
            self.inner.get(phone).await
        }

        async fn put_if_unchanged(
            &self,
            session: &ConversationSession,
            expected_version: u64,
        ) -> std::result::Result<bool, DatabaseError> {
            self.inner.put_if_unchanged(session, expected_version).await
        }

        async fn list_stale(
            &self,
            before: DateTime<Utc>,
        ) -> std::result::Result<Vec<ConversationSession>, DatabaseError> {
            self.inner.list_stale(before).await
        }
    }

    struct Harness {
        router: Arc<MessageRouter>,
        sessions: Arc<MemorySessionStore>,
        results: Arc<MemoryResultStore>,
        transport: Arc<RecordingTransport>,
    }

    fn fast_dispatch() -> DispatchConfig {
        DispatchConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            send_timeout: Duration::from_millis(200),
        }
    }

    fn engine() -> ConversationEngine {
        ConversationEngine::new(Arc::new(InstrumentRegistry::builtin().unwrap()))
    }

    fn harness() -> Harness {
        let sessions = Arc::new(MemorySessionStore::new());
        let results = Arc::new(MemoryResultStore::new());
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Arc::new(OutboundDispatcher::new(transport.clone(), fast_dispatch()));
        let router = MessageRouter::new(
            engine(),
            sessions.clone(),
            results.clone(),
            dispatcher,
            DedupeCache::new(Duration::from_secs(60), 1000),
        );
        Harness {
            router: Arc::new(router),
            sessions,
            results,
            transport,
        }
    }

    fn body(id: &str, text: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "phone": PHONE,
            "text": text,
            "message_id": id,
        }))
        .unwrap()
    }

    fn routed(outcome: RouteOutcome) -> Routed {
        match outcome {
            RouteOutcome::Routed(r) => r,
            RouteOutcome::Duplicate => panic!("expected a routed message"),
        }
    }

    #[tokio::test]
    async fn bulk_questionnaire_end_to_end() {
        let h = harness();
        let now = Utc::now();

        let start = routed(h.router.process(&body("m1", "gad7"), now).await.unwrap());
        assert!(matches!(start.kind, TransitionKind::Started { .. }));

        let done = routed(
            h.router
                .process(&body("m2", "1 2 0 3 1 2 1"), now)
                .await
                .unwrap(),
        );
        assert_eq!(done.kind, TransitionKind::Completed);

        let stored = h.results.results_for_phone(PHONE).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].total_score, 10);
        assert_eq!(stored[0].category, "moderate");
        assert_eq!(stored[0].delivery_status, DeliveryStatus::Sent);

        let session = h.sessions.get(PHONE).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.last_message_id.as_deref(), Some("m2"));

        let sent = h.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].1.contains("Total score: 10"));
    }

    #[tokio::test]
    async fn concurrent_duplicates_apply_once() {
        let h = harness();
        let now = Utc::now();
        h.router.process(&body("m1", "gad7"), now).await.unwrap();

        let attempts = (0..8).map(|_| {
            let router = Arc::clone(&h.router);
            async move { router.process(&body("m2", "3 3 3 3 3 3 3"), now).await }
        });
        let outcomes = join_all(attempts).await;

        let applied = outcomes
            .into_iter()
            .filter(|o| matches!(o, Ok(RouteOutcome::Routed(_))))
            .count();
        assert_eq!(applied, 1);
        assert_eq!(h.results.len().await, 1);
        assert_eq!(h.transport.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn replay_after_cache_eviction_is_caught_by_session() {
        let h = harness();
        let now = Utc::now();
        h.router.process(&body("m1", "gad7"), now).await.unwrap();

        // Bypass the dedupe cache; the session's last applied id still matches.
        let msg = normalize(&body("m1", "gad7"), now).unwrap();
        assert!(matches!(
            h.router.apply(&msg).await.unwrap(),
            RouteOutcome::Duplicate
        ));
        assert_eq!(h.transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_answer_keeps_session() {
        let h = harness();
        let now = Utc::now();
        h.router.process(&body("m1", "gad7"), now).await.unwrap();
        let before = h.sessions.get(PHONE).await.unwrap().unwrap();

        let r = routed(
            h.router
                .process(&body("m2", "1 2 0 3 1 2"), now)
                .await
                .unwrap(),
        );
        assert!(matches!(r.kind, TransitionKind::Rejected(_)));
        assert_eq!(h.sessions.get(PHONE).await.unwrap().unwrap(), before);
        assert!(h.results.is_empty().await);
    }

    #[tokio::test]
    async fn dispatch_failure_does_not_roll_back_session() {
        let h = harness();
        h.transport.fail.store(true, Ordering::SeqCst);
        let now = Utc::now();

        h.router.process(&body("m1", "gad7"), now).await.unwrap();
        h.router
            .process(&body("m2", "0 0 0 0 0 0 0"), now)
            .await
            .unwrap();

        let stored = h.results.results_for_phone(PHONE).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].delivery_status, DeliveryStatus::Failed);
        let session = h.sessions.get(PHONE).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Idle);
    }

    struct SinkHarness {
        router: MessageRouter,
        results: Arc<MemoryResultStore>,
        transport: Arc<RecordingTransport>,
        sink: Arc<CountingSink>,
        handoff: Arc<ResultHandoff>,
    }

    fn sink_harness() -> SinkHarness {
        let results = Arc::new(MemoryResultStore::new());
        let sink = Arc::new(CountingSink::default());
        let transport = Arc::new(RecordingTransport::default());
        let handoff = Arc::new(ResultHandoff::new(results.clone(), sink.clone(), 3));
        let router = MessageRouter::new(
            engine(),
            Arc::new(MemorySessionStore::new()),
            results.clone(),
            Arc::new(OutboundDispatcher::new(transport.clone(), fast_dispatch())),
            DedupeCache::new(Duration::from_secs(60), 100),
        )
        .with_handoff(handoff.clone());
        SinkHarness {
            router,
            results,
            transport,
            sink,
            handoff,
        }
    }

    #[tokio::test]
    async fn completed_result_is_handed_off_once() {
        let h = sink_harness();
        let now = Utc::now();
        h.router.process(&body("m1", "gad7"), now).await.unwrap();
        h.router
            .process(&body("m2", "1 1 1 1 1 1 1"), now)
            .await
            .unwrap();

        assert_eq!(h.sink.calls.load(Ordering::SeqCst), 1);
        assert!(h.results.pending_handoffs(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn handoff_pass_during_delivery_sends_settled_status_once() {
        let h = sink_harness();
        h.transport.fail.store(true, Ordering::SeqCst);
        let now = Utc::now();
        h.router.process(&body("m1", "gad7"), now).await.unwrap();

        let done = routed(
            h.router
                .handle_event(&body("m2", "0 1 0 1 0 1 0"), now)
                .await
                .unwrap(),
        );
        // Reply not yet sent: the background pass must leave the result alone.
        assert_eq!(h.handoff.hand_off_pending().await.unwrap(), 0);
        h.router.deliver(&done).await;
        assert_eq!(h.handoff.hand_off_pending().await.unwrap(), 0);

        assert_eq!(h.sink.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*h.sink.statuses.lock().unwrap(), vec![DeliveryStatus::Failed]);
        let stored = h.results.results_for_phone(PHONE).await.unwrap();
        assert_eq!(stored[0].delivery_status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn malformed_event_is_rejected() {
        let h = harness();
        let err = h
            .router
            .handle_event(br#"{"phone": "+15550001111"}"#, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Gateway(_)));
        assert!(h.sessions.is_empty().await);
    }

    #[tokio::test]
    async fn failed_apply_allows_redelivery() {
        let store = Arc::new(BrokenSessionStore {
            healthy: AtomicBool::new(false),
            inner: MemorySessionStore::new(),
        });
        let dispatcher = Arc::new(OutboundDispatcher::new(
            Arc::new(RecordingTransport::default()),
            fast_dispatch(),
        ));
        let router = MessageRouter::new(
            engine(),
            store.clone(),
            Arc::new(MemoryResultStore::new()),
            dispatcher,
            DedupeCache::new(Duration::from_secs(60), 100),
        );

        let now = Utc::now();
        assert!(router.handle_event(&body("m1", "gad7"), now).await.is_err());

        store.healthy.store(true, Ordering::SeqCst);
        let r = routed(router.handle_event(&body("m1", "gad7"), now).await.unwrap());
        assert!(matches!(r.kind, TransitionKind::Started { .. }));
    }
}
