//! Reply delivery with timeout, classification, and exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::redact::redact_phone;
use super::transport::SmsTransport;
use crate::config::DispatchConfig;
use crate::error::{DeliveryError, TransportError};

/// Final result of delivering one reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent { attempts: u32 },
    Failed { attempts: u32, reason: String },
}

impl DeliveryOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, DeliveryOutcome::Sent { .. })
    }
}

/// Sends replies through a transport, retrying transient failures.
///
/// Stateless apart from its configuration, so one instance serves any number
/// of concurrent sends.
pub struct OutboundDispatcher {
    transport: Arc<dyn SmsTransport>,
    config: DispatchConfig,
}

impl OutboundDispatcher {
    pub fn new(transport: Arc<dyn SmsTransport>, config: DispatchConfig) -> Self {
        Self { transport, config }
    }

    /// Deliver `text` to `phone`. Never returns an error: failures are
    /// reported in the outcome and logged.
    pub async fn send(&self, phone: &str, text: &str) -> DeliveryOutcome {
        let redacted = redact_phone(phone);
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let result = match tokio::time::timeout(
                self.config.send_timeout,
                self.transport.send(phone, text),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(self.config.send_timeout)),
            };

            let err = match result {
                Ok(()) => {
                    info!(
                        phone = %redacted,
                        attempt,
                        transport = self.transport.name(),
                        outcome = "sent",
                        "Reply delivered"
                    );
                    return DeliveryOutcome::Sent { attempts: attempt };
                }
                Err(err) => DeliveryError::from(&err),
            };

            if !err.is_transient() {
                warn!(
                    phone = %redacted,
                    attempt,
                    outcome = "permanent_failure",
                    error = %err,
                    "Reply delivery failed permanently"
                );
                return DeliveryOutcome::Failed {
                    attempts: attempt,
                    reason: err.to_string(),
                };
            }

            if attempt == max_attempts {
                warn!(
                    phone = %redacted,
                    attempt,
                    outcome = "exhausted",
                    error = %err,
                    "Reply delivery gave up after transient failures"
                );
                return DeliveryOutcome::Failed {
                    attempts: attempt,
                    reason: err.to_string(),
                };
            }

            let delay = self.backoff(attempt);
            warn!(
                phone = %redacted,
                attempt,
                outcome = "transient_failure",
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Reply delivery failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }

        // Loop always returns; max_attempts >= 1.
        DeliveryOutcome::Failed {
            attempts: max_attempts,
            reason: "no attempts made".into(),
        }
    }

    /// Delay before retry number `attempt` (1-based): exponential, capped,
    /// plus up to 50% random jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let delay = backoff_delay(&self.config, attempt);
        let jitter_cap = (delay.as_millis() as u64) / 2;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        delay + Duration::from_millis(jitter)
    }
}

/// Exponential delay without jitter: `base * 2^(attempt-1)`, capped at `max_delay`.
pub fn backoff_delay(config: &DispatchConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    config
        .base_delay
        .saturating_mul(factor)
        .min(config.max_delay)
}
