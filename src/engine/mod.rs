//! Conversation engine: the questionnaire state machine and the router that
//! feeds it.

pub mod machine;
pub mod prompts;
pub mod router;

pub use machine::{ConversationEngine, Rejection, Transition, TransitionKind};
pub use router::{MessageRouter, RouteOutcome, Routed};
