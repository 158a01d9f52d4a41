//! Error types for the compliance advisor.

use std::time::Duration;

use crate::session::SessionState;
use crate::workflow::types::Stage;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Invalid input: {0}")]
    Input(#[from] crate::dispatcher::InputError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Outbound channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Rate limited on channel {name}")]
    RateLimited { name: String },
}

/// Inbound webhook errors.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Webhook authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid webhook envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Dispatcher queue closed")]
    QueueClosed,
}

/// Session manager errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No live session for sender {sender}")]
    NotFound { sender: String },

    #[error("Session {session_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        session_id: String,
        from: SessionState,
        to: SessionState,
    },

    #[error("Persistence failed: {0}")]
    Storage(#[from] DatabaseError),
}

/// A single stage call failed.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Timeout, 5xx, 429 or connection failure. Eligible for retry.
    #[error("{stage} transient failure: {reason}")]
    Transient { stage: Stage, reason: String },

    /// The stage output did not match its expected shape. Never retried.
    #[error("{stage} returned invalid output: {reason}")]
    SchemaValidation { stage: Stage, reason: String },

    /// The service refused the request (4xx other than 429). Never retried.
    #[error("{stage} rejected the request: {reason}")]
    Rejected { stage: Stage, reason: String },
}

impl StageError {
    /// Whether the orchestrator should retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::Transient { stage, .. }
            | Self::SchemaValidation { stage, .. }
            | Self::Rejected { stage, .. } => *stage,
        }
    }
}

/// A pipeline run failed.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Stage {stage} failed after {attempts} attempt(s): {source}")]
    FatalStage {
        stage: Stage,
        attempts: u32,
        #[source]
        source: StageError,
    },

    #[error("Workflow exceeded its deadline of {deadline:?}")]
    Timeout { deadline: Duration },

    #[error("A pipeline run is already active for session {session_id}")]
    AlreadyRunning { session_id: String },

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

impl WorkflowError {
    /// The stage the failure is attributed to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::FatalStage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
