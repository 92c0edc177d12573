//! Messaging transports: the opaque `(phone, text)` send capability.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::debug;

use super::redact::redact_phone;
use crate::config::TransportConfig;
use crate::error::TransportError;

/// A single send attempt to an external messaging provider.
#[async_trait]
pub trait SmsTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, phone: &str, text: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    to: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<&'a str>,
    body: &'a str,
}

/// JSON-over-HTTP messaging provider.
pub struct HttpSmsTransport {
    url: String,
    auth_token: SecretString,
    from: Option<String>,
    client: reqwest::Client,
}

impl HttpSmsTransport {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            url: config.url.clone(),
            auth_token: config.auth_token.clone(),
            from: config.from.clone(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SmsTransport for HttpSmsTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, phone: &str, text: &str) -> Result<(), TransportError> {
        let body = SendRequest {
            to: phone,
            from: self.from.as_deref(),
            body: text,
        };

        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(self.auth_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "Transport accepted message");
            return Ok(());
        }

        let err_body = resp.text().await.unwrap_or_default();
        Err(TransportError::Status {
            status: status.as_u16(),
            body: err_body.chars().take(200).collect(),
        })
    }
}

/// Prints replies to stderr. Used when no provider is configured.
pub struct ConsoleTransport;

#[async_trait]
impl SmsTransport for ConsoleTransport {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, phone: &str, text: &str) -> Result<(), TransportError> {
        eprintln!("{}\n{text}\n", console_header(phone));
        Ok(())
    }
}

fn console_header(phone: &str) -> String {
    format!("── reply to {} ──", redact_phone(phone))
}
