//! Outbound dispatcher: reply delivery with bounded retry.

pub mod dispatcher;
pub mod redact;
pub mod transport;

pub use dispatcher::{DeliveryOutcome, OutboundDispatcher};
pub use redact::redact_phone;
pub use transport::{ConsoleTransport, HttpSmsTransport, SmsTransport};
