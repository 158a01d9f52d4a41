//! `Database` trait: the single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::session::Session;
use crate::workflow::types::ComplianceRoadmap;

/// Who produced a logged conversation line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "outbound" => Self::Outbound,
            _ => Self::Inbound,
        }
    }
}

/// One line of the per-session conversation log.
#[derive(Debug, Clone)]
pub struct ConversationEntry {
    pub session_id: String,
    pub sender: String,
    pub direction: Direction,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ConversationEntry {
    pub fn inbound(session_id: &str, sender: &str, content: &str) -> Self {
        Self::new(session_id, sender, Direction::Inbound, content)
    }

    pub fn outbound(session_id: &str, sender: &str, content: &str) -> Self {
        Self::new(session_id, sender, Direction::Outbound, content)
    }

    fn new(session_id: &str, sender: &str, direction: Direction, content: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            sender: sender.to_string(),
            direction,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Backend-agnostic database trait covering sessions, roadmaps and the conversation log.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Sessions ────────────────────────────────────────────────────

    /// Insert or replace a session row keyed by `session_id`.
    async fn upsert_session(&self, session: &Session) -> Result<(), DatabaseError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, DatabaseError>;

    /// Most recent non-terminal, unexpired session for a sender.
    async fn get_live_session(
        &self,
        sender: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, DatabaseError>;

    /// Delete sessions whose `expires_at` is at or before `now`.
    /// Returns the number of rows removed.
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError>;

    // ── Roadmaps ────────────────────────────────────────────────────

    async fn save_roadmap(
        &self,
        sender: &str,
        roadmap: &ComplianceRoadmap,
    ) -> Result<(), DatabaseError>;

    async fn get_roadmap(&self, session_id: &str)
    -> Result<Option<ComplianceRoadmap>, DatabaseError>;

    // ── Conversation log ────────────────────────────────────────────

    async fn log_conversation(&self, entry: &ConversationEntry) -> Result<(), DatabaseError>;

    /// Oldest-first log lines for a session, up to `limit`.
    async fn conversation_history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationEntry>, DatabaseError>;
}
