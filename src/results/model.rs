//! Assessment result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery state of the completion reply. The only mutable result field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// Identifies one questionnaire attempt. At most one result exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultKey {
    pub phone: String,
    pub instrument_id: String,
    pub started_at: DateTime<Utc>,
}

impl std::fmt::Display for ResultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.phone,
            self.instrument_id,
            self.started_at.timestamp_millis()
        )
    }
}

/// A scored, categorized, completed questionnaire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentResult {
    pub phone: String,
    pub instrument_id: String,
    pub answers: Vec<u32>,
    pub total_score: u32,
    pub category: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
}

impl AssessmentResult {
    pub fn key(&self) -> ResultKey {
        ResultKey {
            phone: self.phone.clone(),
            instrument_id: self.instrument_id.clone(),
            started_at: self.started_at,
        }
    }
}
