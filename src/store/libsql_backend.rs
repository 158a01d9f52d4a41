//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases over a single shared connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::session::{Session, SessionState};
use crate::store::migrations;
use crate::store::traits::{ConversationEntry, Database, Direction};
use crate::workflow::types::ComplianceRoadmap;

/// libSQL database backend.
///
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
        backend.run_migrations().await?;
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
        backend.run_migrations().await?;
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

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed-width so text comparison orders correctly.
fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const SESSION_COLUMNS: &str = "session_id, sender, state, business_type, location, specific_area, products, message_count, created_at, updated_at, expires_at";

/// Column order matches SESSION_COLUMNS.
fn row_to_session(row: &libsql::Row) -> Result<Session, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("session row parse: {e}"));

    let state_str: String = row.get(2).map_err(read)?;
    let state = state_str
        .parse::<SessionState>()
        .map_err(DatabaseError::Serialization)?;
    let products_json: String = row.get(6).map_err(read)?;
    let products: Vec<String> = serde_json::from_str(&products_json)
        .map_err(|e| DatabaseError::Serialization(format!("session products: {e}")))?;
    let message_count: i64 = row.get(7).map_err(read)?;
    let created_str: String = row.get(8).map_err(read)?;
    let updated_str: String = row.get(9).map_err(read)?;
    let expires_str: String = row.get(10).map_err(read)?;

    Ok(Session {
        session_id: row.get(0).map_err(read)?,
        sender: row.get(1).map_err(read)?,
        state,
        business_type: row.get(3).ok(),
        location: row.get(4).ok(),
        specific_area: row.get(5).ok(),
        products,
        message_count: u32::try_from(message_count).unwrap_or(u32::MAX),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        expires_at: parse_datetime(&expires_str),
    })
}

fn row_to_entry(row: &libsql::Row) -> Result<ConversationEntry, libsql::Error> {
    let direction: String = row.get(2)?;
    let created_str: String = row.get(4)?;
    Ok(ConversationEntry {
        session_id: row.get(0)?,
        sender: row.get(1)?,
        direction: Direction::parse(&direction),
        content: row.get(3)?,
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Sessions ────────────────────────────────────────────────────

    async fn upsert_session(&self, session: &Session) -> Result<(), DatabaseError> {
        let products = serde_json::to_string(&session.products)
            .map_err(|e| DatabaseError::Serialization(format!("session products: {e}")))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO sessions ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    session.session_id.as_str(),
                    session.sender.as_str(),
                    session.state.as_str(),
                    opt_text(session.business_type.as_deref()),
                    opt_text(session.location.as_deref()),
                    opt_text(session.specific_area.as_deref()),
                    products,
                    i64::from(session.message_count),
                    fmt_datetime(session.created_at),
                    fmt_datetime(session.updated_at),
                    fmt_datetime(session.expires_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_session: {e}")))?;

        debug!(session_id = %session.session_id, state = %session.state, "Session persisted");
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
                params![session_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_session(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_session: {e}"))),
        }
    }

    async fn get_live_session(
        &self,
        sender: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE sender = ?1 AND expires_at > ?2 AND state NOT IN ('complete', 'failed') ORDER BY updated_at DESC LIMIT 1"
                ),
                params![sender, fmt_datetime(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_live_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_session(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_live_session: {e}"))),
        }
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM sessions WHERE expires_at <= ?1",
                params![fmt_datetime(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_expired_sessions: {e}")))?;

        if count > 0 {
            info!(count, "Deleted expired sessions from DB");
        }
        Ok(count as usize)
    }

    // ── Roadmaps ────────────────────────────────────────────────────

    async fn save_roadmap(
        &self,
        sender: &str,
        roadmap: &ComplianceRoadmap,
    ) -> Result<(), DatabaseError> {
        let body = roadmap
            .to_json()
            .map_err(|e| DatabaseError::Serialization(format!("roadmap body: {e}")))?;
        let cost = i64::try_from(roadmap.total_estimated_cost()).unwrap_or(i64::MAX);

        self.conn()
            .execute(
                "INSERT OR REPLACE INTO roadmaps (session_id, sender, business_type, location, total_estimated_cost, total_timeline_days, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    roadmap.session_id(),
                    sender,
                    roadmap.business_type(),
                    roadmap.location(),
                    cost,
                    i64::from(roadmap.total_timeline_days()),
                    body,
                    fmt_datetime(roadmap.generated_at()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_roadmap: {e}")))?;

        debug!(session_id = roadmap.session_id(), "Roadmap persisted");
        Ok(())
    }

    async fn get_roadmap(
        &self,
        session_id: &str,
    ) -> Result<Option<ComplianceRoadmap>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT body FROM roadmaps WHERE session_id = ?1",
                params![session_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_roadmap: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get_roadmap: {e}"))),
        };
        let body: String = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("get_roadmap row parse: {e}")))?;

        match ComplianceRoadmap::from_json(&body) {
            Ok(roadmap) => Ok(Some(roadmap)),
            Err(e) => {
                warn!(session_id, error = %e, "Stored roadmap is unreadable");
                Err(DatabaseError::Serialization(format!("roadmap body: {e}")))
            }
        }
    }

    // ── Conversation log ────────────────────────────────────────────

    async fn log_conversation(&self, entry: &ConversationEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO conversation_log (session_id, sender, direction, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.session_id.as_str(),
                    entry.sender.as_str(),
                    entry.direction.as_str(),
                    entry.content.as_str(),
                    fmt_datetime(entry.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("log_conversation: {e}")))?;
        Ok(())
    }

    async fn conversation_history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT session_id, sender, direction, content, created_at FROM conversation_log WHERE session_id = ?1 ORDER BY id ASC LIMIT ?2",
                params![session_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("conversation_history: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("conversation_history: {e}")))?
        {
            entries.push(
                row_to_entry(&row)
                    .map_err(|e| DatabaseError::Query(format!("conversation_history row parse: {e}")))?,
            );
        }
        Ok(entries)
    }
}
