//! Inbound event schema and normalization.
//!
//! The webhook body is decoded into [`RawEvent`], an explicit schema. Anything
//! that does not fit fails closed as a malformed event.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// E.164-ish: optional plus, 7 to 15 digits.
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9]{7,15}$").expect("valid phone regex"));

/// Provider webhook payload. Unknown envelope fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEvent {
    #[serde(default, alias = "from")]
    pub phone: Option<String>,
    #[serde(default, alias = "body")]
    pub text: Option<String>,
    #[serde(default, alias = "id", alias = "messageId")]
    pub message_id: Option<String>,
}

/// Canonical inbound message handed to the conversation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub phone: String,
    pub text: String,
    pub message_id: String,
    pub received_at: DateTime<Utc>,
}

/// Strip formatting characters and validate the result.
pub fn normalize_phone(raw: &str) -> Result<String, GatewayError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();
    if PHONE_RE.is_match(&cleaned) {
        Ok(cleaned)
    } else {
        Err(GatewayError::InvalidPhone(raw.to_string()))
    }
}

/// Decode and validate a raw webhook body.
pub fn normalize(body: &[u8], received_at: DateTime<Utc>) -> Result<InboundMessage, GatewayError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| GatewayError::InvalidJson(e.to_string()))?;
    if !value.is_object() {
        return Err(GatewayError::InvalidJson("expected a JSON object".into()));
    }
    let raw: RawEvent =
        serde_json::from_value(value).map_err(|e| GatewayError::InvalidJson(e.to_string()))?;
    normalize_event(raw, received_at)
}

/// Validate an already-decoded event.
pub fn normalize_event(
    raw: RawEvent,
    received_at: DateTime<Utc>,
) -> Result<InboundMessage, GatewayError> {
    let phone = raw
        .phone
        .filter(|p| !p.trim().is_empty())
        .ok_or(GatewayError::MissingField("phone"))?;
    let text = raw
        .text
        .filter(|t| !t.trim().is_empty())
        .ok_or(GatewayError::MissingField("text"))?;
    let message_id = raw
        .message_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or(GatewayError::MissingField("message_id"))?;

    Ok(InboundMessage {
        phone: normalize_phone(&phone)?,
        text,
        message_id,
        received_at,
    })
}
