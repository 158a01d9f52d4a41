//! Session state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::types::Classification;

/// Workflow state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, no pipeline run started yet.
    New,
    Classifying,
    Mapping,
    Synthesizing,
    Planning,
    /// Roadmap delivered. Terminal.
    Complete,
    /// Unrecoverable stage error or deadline. Terminal.
    Failed,
}

impl SessionState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }

        matches!(
            (self, target),
            (New, Classifying)
                | (Classifying, Mapping)
                | (Mapping, Synthesizing)
                | (Synthesizing, Planning)
                | (Planning, Complete)
                | (_, Failed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Classifying => "classifying",
            Self::Mapping => "mapping",
            Self::Synthesizing => "synthesizing",
            Self::Planning => "planning",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "classifying" => Ok(Self::Classifying),
            "mapping" => Ok(Self::Mapping),
            "synthesizing" => Ok(Self::Synthesizing),
            "planning" => Ok(Self::Planning),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown session state: {other}")),
        }
    }
}

/// Per-sender conversational and workflow state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    /// Normalized sender id (E.164 phone number for WhatsApp).
    pub sender: String,
    pub state: SessionState,
    pub business_type: Option<String>,
    pub location: Option<String>,
    pub specific_area: Option<String>,
    pub products: Vec<String>,
    pub message_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Create a fresh session in state `New`.
    pub fn new(sender: impl Into<String>, inactivity_window: Duration) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            state: SessionState::New,
            business_type: None,
            location: None,
            specific_area: None,
            products: Vec::new(),
            message_count: 0,
            created_at: now,
            updated_at: now,
            expires_at: now + window(inactivity_window),
        }
    }

    /// Move to `target` if the state machine allows it.
    pub fn transition_to(
        &mut self,
        target: SessionState,
        inactivity_window: Duration,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(target) {
            return Err(format!("Cannot transition from {} to {}", self.state, target));
        }
        self.state = target;
        self.touch(inactivity_window);
        Ok(())
    }

    /// Record activity, pushing out the expiry.
    pub fn touch(&mut self, inactivity_window: Duration) {
        self.updated_at = Utc::now();
        self.expires_at = self.updated_at + window(inactivity_window);
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// A session accepts new work only while live and non-terminal.
    pub fn is_resumable_at(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && !self.is_expired_at(now)
    }

    /// Copy the extracted business profile from a classification.
    pub fn apply_classification(&mut self, classification: &Classification) {
        self.business_type = Some(classification.business_type.clone());
        self.location = Some(classification.location.clone());
        self.specific_area = classification.specific_area.clone();
        self.products = classification.products.clone();
    }
}

fn window(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
