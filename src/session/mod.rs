//! Conversation sessions: per-phone questionnaire state and its store.

pub mod locks;
pub mod model;
pub mod store;
pub mod sweep;

pub use locks::PhoneLocks;
pub use model::{ConversationSession, SessionStatus};
pub use store::{MemorySessionStore, SessionStore};
