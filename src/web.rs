//! Inbound HTTP surface: the SMS provider webhook and a health probe.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::engine::{MessageRouter, RouteOutcome};
use crate::error::Error;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<MessageRouter>,
}

/// Build the Axum router with the webhook and health routes.
pub fn webhook_routes(router: Arc<MessageRouter>) -> Router {
    Router::new()
        .route("/webhook/sms", post(receive_sms))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { router })
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "sms-screener",
        "catalogue_version": state.router.engine().registry().version(),
    }))
}

// ── Webhook ─────────────────────────────────────────────────────────────

/// The transition is committed before the response. Replies go out in a
/// spawned task so a slow transport never holds the provider's request open.
async fn receive_sms(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    match state.router.handle_event(&body, Utc::now()).await {
        Ok(RouteOutcome::Routed(routed)) => {
            let router = Arc::clone(&state.router);
            tokio::spawn(async move {
                router.deliver(&routed).await;
            });
            (
                StatusCode::OK,
                Json(serde_json::json!({"status": "accepted"})),
            )
        }
        Ok(RouteOutcome::Duplicate) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "duplicate"})),
        ),
        Err(Error::Gateway(e)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({"status": "rejected", "error": e.to_string()})),
        ),
        Err(e) => {
            error!(error = %e, "Inbound message could not be applied");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"status": "error", "error": "temporarily unavailable"})),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::DispatchConfig;
    use crate::dispatch::{ConsoleTransport, OutboundDispatcher};
    use crate::engine::ConversationEngine;
    use crate::gateway::DedupeCache;
    use crate::instruments::InstrumentRegistry;
    use crate::results::MemoryResultStore;
    use crate::session::MemorySessionStore;

    fn app() -> Router {
        let registry = Arc::new(InstrumentRegistry::builtin().unwrap());
        let router = MessageRouter::new(
            ConversationEngine::new(registry),
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemoryResultStore::new()),
            Arc::new(OutboundDispatcher::new(
                Arc::new(ConsoleTransport),
                DispatchConfig::default(),
            )),
            DedupeCache::new(Duration::from_secs(60), 100),
        );
        webhook_routes(Arc::new(router))
    }

    fn post_sms(body: &'static str) -> Request<Body> {
        Request::post("/webhook/sms")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn status_of(app: &Router, req: Request<Body>) -> StatusCode {
        app.clone().oneshot(req).await.unwrap().status()
    }

    #[tokio::test]
    async fn health_reports_catalogue_version() {
        let resp = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["service"], "sms-screener");
        assert_eq!(json["catalogue_version"], 1);
    }

    #[tokio::test]
    async fn webhook_status_codes() {
        let app = app();
        let event = r#"{"from": "+1 (415) 555-0123", "body": "GAD7", "id": "sm-1"}"#;

        assert_eq!(status_of(&app, post_sms(event)).await, StatusCode::OK);
        // Replays are acknowledged, not re-applied.
        assert_eq!(status_of(&app, post_sms(event)).await, StatusCode::OK);
        assert_eq!(
            status_of(&app, post_sms("not json")).await,
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(&app, post_sms(r#"{"from": "12", "body": "hi", "id": "x"}"#)).await,
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
