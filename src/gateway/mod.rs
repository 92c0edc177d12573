//! Message gateway: normalizes inbound transport events and filters replays.

pub mod dedupe;
pub mod event;

pub use dedupe::DedupeCache;
pub use event::{InboundMessage, RawEvent, normalize, normalize_phone};
