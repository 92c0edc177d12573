//! Result sink: the external persistence/admin boundary.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use super::model::AssessmentResult;
use crate::config::SinkConfig;
use crate::error::SinkError;

/// Receives each completed result. Implementations must treat the
/// idempotency key as a dedupe key: handoff is retried until acknowledged.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn hand_off(&self, result: &AssessmentResult) -> Result<(), SinkError>;
}

#[derive(Serialize)]
struct HandoffBody<'a> {
    idempotency_key: String,
    #[serde(flatten)]
    result: &'a AssessmentResult,
}

/// POSTs results as JSON to the admin API.
pub struct HttpResultSink {
    url: String,
    auth_token: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpResultSink {
    pub fn new(config: &SinkConfig) -> Self {
        Self {
            url: config.url.clone(),
            auth_token: config.auth_token.clone(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ResultSink for HttpResultSink {
    async fn hand_off(&self, result: &AssessmentResult) -> Result<(), SinkError> {
        let key = result.key().to_string();
        let body = HandoffBody {
            idempotency_key: key.clone(),
            result,
        };

        let mut request = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", key)
            .json(&body);
        if let Some(ref token) = self.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let resp = request
            .send()
            .await
            .map_err(|e| SinkError::RequestFailed(e.to_string()))?;

        let status = resp.status();
        // 409: the sink already holds this key.
        if status.is_success() || status.as_u16() == 409 {
            return Ok(());
        }
        let err_body = resp.text().await.unwrap_or_default();
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body: err_body.chars().take(200).collect(),
        })
    }
}
