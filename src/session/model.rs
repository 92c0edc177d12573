//! Conversation session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a patient is within a questionnaire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No questionnaire in progress.
    Idle,
    /// Waiting for the answer to `current_step`.
    AwaitingStepAnswer,
    /// Waiting for all answers in one message.
    AwaitingBulkAnswers,
    /// All answers collected. Never persisted: the router re-arms to `Idle`
    /// once the result has been recorded.
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::AwaitingStepAnswer => "awaiting_step_answer",
            SessionStatus::AwaitingBulkAnswers => "awaiting_bulk_answers",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn is_awaiting(&self) -> bool {
        matches!(
            self,
            SessionStatus::AwaitingStepAnswer | SessionStatus::AwaitingBulkAnswers
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SessionStatus::Idle),
            "awaiting_step_answer" => Ok(SessionStatus::AwaitingStepAnswer),
            "awaiting_bulk_answers" => Ok(SessionStatus::AwaitingBulkAnswers),
            "completed" => Ok(SessionStatus::Completed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// One patient's conversation state, keyed by phone number.
///
/// `answers.len() == current_step` at all times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub phone: String,
    pub instrument_id: Option<String>,
    pub status: SessionStatus,
    pub current_step: usize,
    pub answers: Vec<u32>,
    /// Last applied inbound message id.
    pub last_message_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Store version for optimistic concurrency. 0 = not yet stored.
    pub version: u64,
}

impl ConversationSession {
    /// A fresh idle session for a phone with no stored state.
    pub fn idle(phone: &str, now: DateTime<Utc>) -> Self {
        Self {
            phone: phone.to_string(),
            instrument_id: None,
            status: SessionStatus::Idle,
            current_step: 0,
            answers: Vec::new(),
            last_message_id: None,
            started_at: None,
            updated_at: now,
            version: 0,
        }
    }

    /// Discard any in-flight questionnaire and start `instrument_id` at step 0.
    pub fn restart(&mut self, instrument_id: &str, bulk: bool, now: DateTime<Utc>) {
        self.instrument_id = Some(instrument_id.to_string());
        self.status = if bulk {
            SessionStatus::AwaitingBulkAnswers
        } else {
            SessionStatus::AwaitingStepAnswer
        };
        self.current_step = 0;
        self.answers.clear();
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Return to idle, keeping the idempotence marker.
    pub fn rearm(&mut self, now: DateTime<Utc>) {
        self.instrument_id = None;
        self.status = SessionStatus::Idle;
        self.current_step = 0;
        self.answers.clear();
        self.started_at = None;
        self.updated_at = now;
    }
}
