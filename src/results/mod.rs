//! Assessment results: durable outbox and handoff to the external result sink.

pub mod handoff;
pub mod model;
pub mod sink;
pub mod store;

pub use handoff::{HandoffOutcome, ResultHandoff};
pub use model::{AssessmentResult, DeliveryStatus, ResultKey};
pub use sink::{HttpResultSink, ResultSink};
pub use store::{MemoryResultStore, PendingHandoff, ResultStore};
