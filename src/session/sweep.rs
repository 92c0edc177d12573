//! Idle-session sweep: returns abandoned questionnaires to idle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use super::store::SessionStore;
use crate::dispatch::redact_phone;
use crate::error::DatabaseError;

/// Re-arm every awaiting session untouched for longer than `idle_timeout`.
/// Returns the number of sessions re-armed.
///
/// Writes go through `put_if_unchanged`, so a session that moved on since it
/// was listed is skipped rather than clobbered.
pub async fn rearm_idle_sessions(
    store: &dyn SessionStore,
    idle_timeout: Duration,
) -> Result<usize, DatabaseError> {
    let now = Utc::now();
    let cutoff = now
        - chrono::Duration::from_std(idle_timeout)
            .map_err(|e| DatabaseError::Query(format!("idle timeout out of range: {e}")))?;

    let mut rearmed = 0;
    for mut session in store.list_stale(cutoff).await? {
        let expected = session.version;
        let instrument = session.instrument_id.clone().unwrap_or_default();
        session.rearm(now);
        if store.put_if_unchanged(&session, expected).await? {
            info!(
                phone = %redact_phone(&session.phone),
                instrument = %instrument,
                "Idle questionnaire session re-armed"
            );
            rearmed += 1;
        }
    }
    Ok(rearmed)
}

/// Spawn a background task that periodically re-arms idle sessions.
pub fn spawn_idle_sweep(
    store: Arc<dyn SessionStore>,
    idle_timeout: Duration,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = rearm_idle_sessions(store.as_ref(), idle_timeout).await {
                warn!(error = %e, "Idle session sweep failed");
            }
        }
    })
}
