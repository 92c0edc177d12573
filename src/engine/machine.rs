//! Questionnaire state machine.
//!
//! `ConversationEngine::apply` is pure: it takes the current session and one
//! inbound message and returns the next session, the replies to send, and a
//! result if the questionnaire completed. Persistence is the router's job.

use std::sync::Arc;

use super::prompts;
use crate::gateway::InboundMessage;
use crate::instruments::{InstrumentDefinition, InstrumentRegistry};
use crate::results::{AssessmentResult, DeliveryStatus};
use crate::session::{ConversationSession, SessionStatus};

/// Why an answer was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Text contains something other than digits and whitespace.
    NotNumeric,
    /// Stepwise mode got zero or several tokens.
    NotSingleAnswer,
    WrongCount { expected: usize, got: usize },
    /// 1-based position of the offending token.
    OutOfDomain { position: usize, token: String },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::NotNumeric => write!(f, "not numeric"),
            Rejection::NotSingleAnswer => write!(f, "expected a single answer"),
            Rejection::WrongCount { expected, got } => {
                write!(f, "expected {expected} answers, got {got}")
            }
            Rejection::OutOfDomain { position, token } => {
                write!(f, "answer {position} ({token:?}) outside the answer domain")
            }
        }
    }
}

/// What a message did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionKind {
    /// Message id equals the session's last applied id.
    AlreadyApplied,
    /// Instrument command; any in-flight questionnaire was discarded.
    Started { instrument_id: String },
    /// Stepwise answer accepted, more to come.
    Advanced { step: usize },
    /// All answers collected and scored.
    Completed,
    /// Stored session pointed at an instrument no longer in the catalogue.
    Withdrawn,
    /// Answer not accepted; session unchanged.
    Rejected(Rejection),
    /// Free text with nothing in progress; session unchanged.
    Help,
}

/// Output of one state machine step.
#[derive(Debug, Clone)]
pub struct Transition {
    pub kind: TransitionKind,
    /// Next session state. Equal to the input unless [`Transition::mutated`].
    pub session: ConversationSession,
    pub replies: Vec<String>,
    pub result: Option<AssessmentResult>,
}

impl Transition {
    /// Whether the session must be written back.
    pub fn mutated(&self) -> bool {
        matches!(
            self.kind,
            TransitionKind::Started { .. }
                | TransitionKind::Advanced { .. }
                | TransitionKind::Completed
                | TransitionKind::Withdrawn
        )
    }

    fn unchanged(kind: TransitionKind, session: &ConversationSession, reply: Option<String>) -> Self {
        Self {
            kind,
            session: session.clone(),
            replies: reply.into_iter().collect(),
            result: None,
        }
    }
}

/// The conversation state machine over a fixed instrument registry.
pub struct ConversationEngine {
    registry: Arc<InstrumentRegistry>,
}

impl ConversationEngine {
    pub fn new(registry: Arc<InstrumentRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &InstrumentRegistry {
        &self.registry
    }

    /// Apply one inbound message to a session.
    pub fn apply(&self, session: &ConversationSession, msg: &InboundMessage) -> Transition {
        if session.last_message_id.as_deref() == Some(msg.message_id.as_str()) {
            return Transition::unchanged(TransitionKind::AlreadyApplied, session, None);
        }

        if let Some(def) = self.registry.match_command(&msg.text) {
            return self.start(session, msg, &def);
        }

        if !session.status.is_awaiting() {
            return Transition::unchanged(
                TransitionKind::Help,
                session,
                Some(prompts::idle_help(&self.registry)),
            );
        }

        let Some(def) = session
            .instrument_id
            .as_deref()
            .and_then(|id| self.registry.get(id))
        else {
            let mut next = session.clone();
            next.rearm(msg.received_at);
            next.last_message_id = Some(msg.message_id.clone());
            return Transition {
                kind: TransitionKind::Withdrawn,
                session: next,
                replies: vec![prompts::instrument_withdrawn(&self.registry)],
                result: None,
            };
        };

        match session.status {
            SessionStatus::AwaitingBulkAnswers => match parse_bulk(&def, &msg.text) {
                Ok(answers) => self.complete(session, msg, &def, answers),
                Err(rejection) => {
                    let reply = prompts::bulk_reprompt(&def, &rejection);
                    Transition::unchanged(TransitionKind::Rejected(rejection), session, Some(reply))
                }
            },
            SessionStatus::AwaitingStepAnswer => {
                match parse_step(&def, session.current_step, &msg.text) {
                    Ok(value) => self.advance(session, msg, &def, value),
                    Err(rejection) => {
                        let reply = prompts::step_reprompt(&def, session.current_step);
                        Transition::unchanged(
                            TransitionKind::Rejected(rejection),
                            session,
                            Some(reply),
                        )
                    }
                }
            }
            SessionStatus::Idle | SessionStatus::Completed => Transition::unchanged(
                TransitionKind::Help,
                session,
                Some(prompts::idle_help(&self.registry)),
            ),
        }
    }

    fn start(
        &self,
        session: &ConversationSession,
        msg: &InboundMessage,
        def: &InstrumentDefinition,
    ) -> Transition {
        let mut next = session.clone();
        next.restart(&def.id, def.bulk_intake, msg.received_at);
        next.last_message_id = Some(msg.message_id.clone());

        let reply = if def.bulk_intake {
            prompts::full_instructions(def)
        } else {
            prompts::step_prompt(def, 0)
        };
        Transition {
            kind: TransitionKind::Started {
                instrument_id: def.id.clone(),
            },
            session: next,
            replies: vec![reply],
            result: None,
        }
    }

    fn advance(
        &self,
        session: &ConversationSession,
        msg: &InboundMessage,
        def: &InstrumentDefinition,
        value: u32,
    ) -> Transition {
        let mut answers = session.answers.clone();
        answers.push(value);
        if answers.len() == def.len() {
            return self.complete(session, msg, def, answers);
        }

        let mut next = session.clone();
        next.answers = answers;
        next.current_step = next.answers.len();
        next.last_message_id = Some(msg.message_id.clone());
        next.updated_at = msg.received_at;

        Transition {
            kind: TransitionKind::Advanced {
                step: next.current_step,
            },
            replies: vec![prompts::step_prompt(def, next.current_step)],
            session: next,
            result: None,
        }
    }

    fn complete(
        &self,
        session: &ConversationSession,
        msg: &InboundMessage,
        def: &InstrumentDefinition,
        answers: Vec<u32>,
    ) -> Transition {
        let assessment = def.assess(&answers);

        let mut next = session.clone();
        next.status = SessionStatus::Completed;
        next.current_step = def.len();
        next.answers = answers.clone();
        next.last_message_id = Some(msg.message_id.clone());
        next.updated_at = msg.received_at;

        let result = AssessmentResult {
            phone: session.phone.clone(),
            instrument_id: def.id.clone(),
            answers,
            total_score: assessment.total_score,
            category: assessment.category.clone(),
            started_at: session.started_at.unwrap_or(msg.received_at),
            completed_at: msg.received_at,
            delivery_status: DeliveryStatus::Pending,
        };

        Transition {
            kind: TransitionKind::Completed,
            session: next,
            replies: vec![prompts::completion(def, &assessment)],
            result: Some(result),
        }
    }
}

/// All answers in one message: digits and whitespace only, one in-domain
/// token per prompt.
fn parse_bulk(def: &InstrumentDefinition, text: &str) -> Result<Vec<u32>, Rejection> {
    let trimmed = text.trim();
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || c.is_whitespace())
    {
        return Err(Rejection::NotNumeric);
    }

    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    if tokens.len() != def.len() {
        return Err(Rejection::WrongCount {
            expected: def.len(),
            got: tokens.len(),
        });
    }

    def.prompts
        .iter()
        .zip(tokens)
        .map(|(prompt, token)| {
            token
                .parse::<u32>()
                .ok()
                .filter(|v| prompt.accepts(*v))
                .ok_or_else(|| Rejection::OutOfDomain {
                    position: prompt.index + 1,
                    token: token.to_string(),
                })
        })
        .collect()
}

/// Exactly one in-domain token for the current step.
fn parse_step(def: &InstrumentDefinition, step: usize, text: &str) -> Result<u32, Rejection> {
    let Some(prompt) = def.prompt(step) else {
        return Err(Rejection::NotSingleAnswer);
    };
    let mut tokens = text.split_whitespace();
    let (Some(token), None) = (tokens.next(), tokens.next()) else {
        return Err(Rejection::NotSingleAnswer);
    };
    if !token.chars().all(|c| c.is_ascii_digit()) {
        return Err(Rejection::NotNumeric);
    }
    token
        .parse::<u32>()
        .ok()
        .filter(|v| prompt.accepts(*v))
        .ok_or_else(|| Rejection::OutOfDomain {
            position: step + 1,
            token: token.to_string(),
        })
}
