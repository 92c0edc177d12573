//! libSQL backend: durable `SessionStore` and `ResultStore`.
//!
//! Supports local file and in-memory databases. Both stores share one
//! connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::results::{AssessmentResult, DeliveryStatus, PendingHandoff, ResultKey, ResultStore};
use crate::session::{ConversationSession, SessionStatus, SessionStore};
use crate::store::migrations;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Full-precision RFC 3339, so timestamps survive a round trip unchanged.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn encode_answers(answers: &[u32]) -> Result<String, DatabaseError> {
    serde_json::to_string(answers).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn decode_answers(s: &str) -> Result<Vec<u32>, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn row_err(context: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{context}: {e}"))
}

const SESSION_COLUMNS: &str = "phone, instrument_id, status, current_step, answers, \
     last_message_id, started_at, updated_at, version";

/// Map a row selected with `SESSION_COLUMNS`.
fn row_to_session(row: &libsql::Row) -> Result<ConversationSession, DatabaseError> {
    let err = row_err("session row");
    let phone: String = row.get(0).map_err(&err)?;
    let instrument_id: Option<String> = row.get(1).ok();
    let status_str: String = row.get(2).map_err(&err)?;
    let current_step: i64 = row.get(3).map_err(&err)?;
    let answers_str: String = row.get(4).map_err(&err)?;
    let last_message_id: Option<String> = row.get(5).ok();
    let started_str: Option<String> = row.get(6).ok();
    let updated_str: String = row.get(7).map_err(&err)?;
    let version: i64 = row.get(8).map_err(&err)?;

    Ok(ConversationSession {
        phone,
        instrument_id,
        status: status_str
            .parse::<SessionStatus>()
            .map_err(DatabaseError::Serialization)?,
        current_step: current_step as usize,
        answers: decode_answers(&answers_str)?,
        last_message_id,
        started_at: started_str.as_deref().map(parse_datetime).transpose()?,
        updated_at: parse_datetime(&updated_str)?,
        version: version as u64,
    })
}

const RESULT_COLUMNS: &str = "phone, instrument_id, answers, total_score, category, \
     started_at, completed_at, delivery_status, handoff_attempts";

/// Map a row selected with `RESULT_COLUMNS`. Returns the handoff attempt count
/// alongside the result.
fn row_to_result(row: &libsql::Row) -> Result<(AssessmentResult, u32), DatabaseError> {
    let err = row_err("result row");
    let answers_str: String = row.get(2).map_err(&err)?;
    let total_score: i64 = row.get(3).map_err(&err)?;
    let started_str: String = row.get(5).map_err(&err)?;
    let completed_str: String = row.get(6).map_err(&err)?;
    let status_str: String = row.get(7).map_err(&err)?;
    let attempts: i64 = row.get(8).map_err(&err)?;

    let result = AssessmentResult {
        phone: row.get(0).map_err(&err)?,
        instrument_id: row.get(1).map_err(&err)?,
        answers: decode_answers(&answers_str)?,
        total_score: total_score as u32,
        category: row.get(4).map_err(&err)?,
        started_at: parse_datetime(&started_str)?,
        completed_at: parse_datetime(&completed_str)?,
        delivery_status: status_str
            .parse::<DeliveryStatus>()
            .map_err(DatabaseError::Serialization)?,
    };
    Ok((result, attempts as u32))
}

impl LibSqlBackend {
    async fn query_results(
        &self,
        sql: &str,
        args: impl libsql::params::IntoParams,
        context: &str,
    ) -> Result<Vec<(AssessmentResult, u32)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(row_err(context))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err(context))? {
            match row_to_result(&row) {
                Ok(r) => out.push(r),
                Err(e) => error!(
                    error = %e,
                    query = context,
                    "Unreadable assessment result row; operator attention required"
                ),
            }
        }
        Ok(out)
    }

    fn not_found(key: &ResultKey) -> DatabaseError {
        DatabaseError::NotFound {
            entity: "assessment_result".into(),
            id: key.to_string(),
        }
    }
}

// ── Sessions ────────────────────────────────────────────────────────

#[async_trait]
impl SessionStore for LibSqlBackend {
    async fn get(&self, phone: &str) -> Result<Option<ConversationSession>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM conversation_sessions WHERE phone = ?1"),
                params![phone],
            )
            .await
            .map_err(row_err("get_session"))?;

        match rows.next().await.map_err(row_err("get_session"))? {
            Some(row) => Ok(Some(row_to_session(&row)?)),
            None => Ok(None),
        }
    }

    async fn put_if_unchanged(
        &self,
        session: &ConversationSession,
        expected_version: u64,
    ) -> Result<bool, DatabaseError> {
        let answers = encode_answers(&session.answers)?;
        let started_at = session.started_at.as_ref().map(format_datetime);
        let new_version = expected_version as i64 + 1;

        let changed = if expected_version == 0 {
            self.conn()
                .execute(
                    "INSERT OR IGNORE INTO conversation_sessions (phone, instrument_id, status,
                        current_step, answers, last_message_id, started_at, updated_at,
                        updated_ms, version)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        session.phone.as_str(),
                        opt_text(session.instrument_id.as_deref()),
                        session.status.as_str(),
                        session.current_step as i64,
                        answers,
                        opt_text(session.last_message_id.as_deref()),
                        opt_text(started_at.as_deref()),
                        format_datetime(&session.updated_at),
                        session.updated_at.timestamp_millis(),
                        new_version,
                    ],
                )
                .await
                .map_err(row_err("insert_session"))?
        } else {
            self.conn()
                .execute(
                    "UPDATE conversation_sessions SET instrument_id = ?2, status = ?3,
                        current_step = ?4, answers = ?5, last_message_id = ?6, started_at = ?7,
                        updated_at = ?8, updated_ms = ?9, version = ?10
                     WHERE phone = ?1 AND version = ?11",
                    params![
                        session.phone.as_str(),
                        opt_text(session.instrument_id.as_deref()),
                        session.status.as_str(),
                        session.current_step as i64,
                        answers,
                        opt_text(session.last_message_id.as_deref()),
                        opt_text(started_at.as_deref()),
                        format_datetime(&session.updated_at),
                        session.updated_at.timestamp_millis(),
                        new_version,
                        expected_version as i64,
                    ],
                )
                .await
                .map_err(row_err("update_session"))?
        };

        if changed == 0 {
            debug!(expected = expected_version, "Session version mismatch, write rejected");
        }
        Ok(changed == 1)
    }

    async fn list_stale(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<ConversationSession>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM conversation_sessions
                     WHERE status IN ('awaiting_step_answer', 'awaiting_bulk_answers')
                       AND updated_ms < ?1
                     ORDER BY updated_ms ASC"
                ),
                params![before.timestamp_millis()],
            )
            .await
            .map_err(row_err("list_stale_sessions"))?;

        let mut sessions = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err("list_stale_sessions"))? {
            match row_to_session(&row) {
                Ok(s) => sessions.push(s),
                Err(e) => warn!(error = %e, "Skipping session row"),
            }
        }
        Ok(sessions)
    }
}

// ── Results ─────────────────────────────────────────────────────────

#[async_trait]
impl ResultStore for LibSqlBackend {
    async fn record_result(&self, result: &AssessmentResult) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO assessment_results (id, result_key, phone, instrument_id,
                    answers, total_score, category, started_at, completed_at, completed_ms,
                    delivery_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    Uuid::new_v4().to_string(),
                    result.key().to_string(),
                    result.phone.as_str(),
                    result.instrument_id.as_str(),
                    encode_answers(&result.answers)?,
                    result.total_score as i64,
                    result.category.as_str(),
                    format_datetime(&result.started_at),
                    format_datetime(&result.completed_at),
                    result.completed_at.timestamp_millis(),
                    result.delivery_status.as_str(),
                ],
            )
            .await
            .map_err(row_err("record_result"))?;
        Ok(inserted == 1)
    }

    async fn get_result(&self, key: &ResultKey) -> Result<Option<AssessmentResult>, DatabaseError> {
        let found = self
            .query_results(
                &format!("SELECT {RESULT_COLUMNS} FROM assessment_results WHERE result_key = ?1"),
                params![key.to_string()],
                "get_result",
            )
            .await?;
        Ok(found.into_iter().next().map(|(r, _)| r))
    }

    async fn results_for_phone(
        &self,
        phone: &str,
    ) -> Result<Vec<AssessmentResult>, DatabaseError> {
        let found = self
            .query_results(
                &format!(
                    "SELECT {RESULT_COLUMNS} FROM assessment_results
                     WHERE phone = ?1 ORDER BY completed_at ASC, rowid ASC"
                ),
                params![phone],
                "results_for_phone",
            )
            .await?;
        Ok(found.into_iter().map(|(r, _)| r).collect())
    }

    async fn set_delivery_status(
        &self,
        key: &ResultKey,
        status: DeliveryStatus,
    ) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE assessment_results SET delivery_status = ?1 WHERE result_key = ?2",
                params![status.as_str(), key.to_string()],
            )
            .await
            .map_err(row_err("set_delivery_status"))?;
        if updated == 0 {
            return Err(Self::not_found(key));
        }
        Ok(())
    }

    async fn pending_handoffs(
        &self,
        unsettled_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingHandoff>, DatabaseError> {
        let found = self
            .query_results(
                &format!(
                    "SELECT {RESULT_COLUMNS} FROM assessment_results
                     WHERE handed_off = 0
                       AND (delivery_status != 'pending' OR completed_ms < ?1)
                     ORDER BY rowid ASC LIMIT ?2"
                ),
                params![unsettled_before.timestamp_millis(), limit as i64],
                "pending_handoffs",
            )
            .await?;
        Ok(found
            .into_iter()
            .map(|(result, attempts)| PendingHandoff { result, attempts })
            .collect())
    }

    async fn is_handed_off(&self, key: &ResultKey) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT handed_off FROM assessment_results WHERE result_key = ?1",
                params![key.to_string()],
            )
            .await
            .map_err(row_err("is_handed_off"))?;
        match rows.next().await.map_err(row_err("is_handed_off"))? {
            Some(row) => {
                let flag: i64 = row.get(0).map_err(row_err("is_handed_off"))?;
                Ok(flag != 0)
            }
            None => Err(Self::not_found(key)),
        }
    }

    async fn mark_handed_off(&self, key: &ResultKey) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE assessment_results SET handed_off = 1, last_handoff_error = NULL
                 WHERE result_key = ?1",
                params![key.to_string()],
            )
            .await
            .map_err(row_err("mark_handed_off"))?;
        if updated == 0 {
            return Err(Self::not_found(key));
        }
        Ok(())
    }

    async fn record_handoff_failure(
        &self,
        key: &ResultKey,
        error: &str,
    ) -> Result<u32, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE assessment_results
                 SET handoff_attempts = handoff_attempts + 1, last_handoff_error = ?1
                 WHERE result_key = ?2",
                params![error, key.to_string()],
            )
            .await
            .map_err(row_err("record_handoff_failure"))?;
        if updated == 0 {
            return Err(Self::not_found(key));
        }

        let mut rows = self
            .conn()
            .query(
                "SELECT handoff_attempts FROM assessment_results WHERE result_key = ?1",
                params![key.to_string()],
            )
            .await
            .map_err(row_err("record_handoff_failure"))?;
        match rows.next().await.map_err(row_err("record_handoff_failure"))? {
            Some(row) => {
                let attempts: i64 = row.get(0).map_err(row_err("record_handoff_failure"))?;
                Ok(attempts as u32)
            }
            None => Err(Self::not_found(key)),
        }
    }
}
