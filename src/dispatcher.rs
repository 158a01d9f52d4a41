//! Background worker behind the webhook.
//!
//! Each queued message gets its own task. Tasks for different senders run
//! concurrently. A task starts only once the previous message from the same
//! sender is done, so each sender is served in queue order and a message
//! that arrives mid-run waits its turn instead of being dropped.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::format;
use crate::state::AppState;
use crate::store::ConversationEntry;
use crate::webhook::{InboundMessage, sanitize_phone_number};
use crate::workflow::types::ComplianceRoadmap;

const MIN_INPUT_CHARS: usize = 3;
const MAX_INPUT_CHARS: usize = 1000;

const SUSPICIOUS_PATTERNS: [&str; 8] = [
    "<script",
    "javascript:",
    "data:",
    "vbscript:",
    "onload=",
    "onerror=",
    "onclick=",
    "onmouseover=",
];

/// Keyword commands recognised before the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Help,
    Start,
}

impl Command {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_uppercase().as_str() {
            "HELP" | "🆘" | "🆘 HELP" => Some(Self::Help),
            "START" | "RESTART" => Some(Self::Start),
            _ => None,
        }
    }
}

/// Why a message was not accepted as a business description.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("message is {0} characters, need at least {MIN_INPUT_CHARS}")]
    TooShort(usize),
    #[error("message is {0} characters, limit is {MAX_INPUT_CHARS}")]
    TooLong(usize),
    #[error("message contains disallowed content")]
    Suspicious,
}

/// Trim and check a free-text business description.
pub fn validate_input(text: &str) -> Result<&str, InputError> {
    let text = text.trim();
    let chars = text.chars().count();
    if chars < MIN_INPUT_CHARS {
        return Err(InputError::TooShort(chars));
    }
    if chars > MAX_INPUT_CHARS {
        return Err(InputError::TooLong(chars));
    }
    let lowered = text.to_lowercase();
    if SUSPICIOUS_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return Err(InputError::Suspicious);
    }
    Ok(text)
}

/// Drain the queue until `stop` resolves. Messages already queued at that
/// point are still handled, and in-flight tasks are awaited before the
/// returned handle completes.
pub fn spawn<F>(state: AppState, mut rx: mpsc::Receiver<InboundMessage>, stop: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut tasks = JoinSet::new();
        // Per sender, the turn that the next message waits on.
        let mut turns: HashMap<String, oneshot::Receiver<()>> = HashMap::new();
        tokio::pin!(stop);
        let mut stopping = false;
        loop {
            let message = tokio::select! {
                message = rx.recv() => message,
                () = &mut stop, if !stopping => {
                    stopping = true;
                    rx.close();
                    continue;
                }
            };
            let Some(message) = message else { break };
            let (done, next_turn) = oneshot::channel();
            let previous = turns.insert(message.sender.clone(), next_turn);
            let state = state.clone();
            tasks.spawn(async move {
                if let Some(previous) = previous {
                    // Resolves on completion or if that task panicked.
                    previous.await.ok();
                }
                handle_message(&state, message).await;
                done.send(()).ok();
            });
            // Reap finished tasks and settled turns so neither grows unbounded.
            while tasks.try_join_next().is_some() {}
            turns.retain(|_, turn| matches!(turn.try_recv(), Err(TryRecvError::Empty)));
        }
        info!(in_flight = tasks.len(), "Dispatcher queue closed, draining");
        while tasks.join_next().await.is_some() {}
    })
}

/// Handle one inbound message end to end. Never returns an error: every
/// failure ends in a reply to the sender or a log line.
pub async fn handle_message(state: &AppState, message: InboundMessage) {
    let InboundMessage {
        message_id,
        sender,
        text,
    } = message;

    if !state.rate_limiter.allow(&sender) {
        warn!(sender = %sender, message_id = %message_id, "Message throttled");
        reply(state, &sender, None, format::throttled_message()).await;
        return;
    }

    match Command::parse(&text) {
        Some(Command::Help) => {
            reply(state, &sender, None, format::help_message()).await;
            return;
        }
        Some(Command::Start) => {
            let _guard = state.sessions.lock_sender(&sender).await;
            let session = state.sessions.reset(&sender).await;
            reply(state, &sender, Some(&session.session_id), format::welcome_message()).await;
            return;
        }
        None => {}
    }

    let text = match validate_input(&text) {
        Ok(text) => text,
        Err(e) => {
            warn!(sender = %sender, message_id = %message_id, reason = %e, "Invalid input");
            reply(state, &sender, None, format::invalid_input_message()).await;
            return;
        }
    };

    let _guard = state.sessions.lock_sender(&sender).await;
    let session = state.sessions.create_or_get(&sender).await;
    debug!(
        session_id = %session.session_id,
        sender = %sender,
        message_id = %message_id,
        state = %session.state,
        "Dispatching message"
    );
    log_entry(state, ConversationEntry::inbound(&session.session_id, &sender, text)).await;

    reply(state, &sender, None, format::processing_message()).await;

    // The orchestrator logs failures with stage detail and marks the session failed.
    let text = match state.orchestrator.invoke(&session, text).await {
        Ok(roadmap) => format::format(&roadmap),
        Err(_) => format::failure_message().to_string(),
    };
    reply(state, &sender, Some(&session.session_id), &text).await;
}

/// Run the pipeline for a query that arrived over the operator API.
///
/// Shares the sender lock with chat traffic, so a query never overlaps a
/// run for the same number. Nothing is sent over WhatsApp.
pub async fn run_query(
    state: &AppState,
    phone_number: &str,
    query: &str,
) -> crate::error::Result<ComplianceRoadmap> {
    let sender = sanitize_phone_number(phone_number);
    let query = validate_input(query)?;

    let _guard = state.sessions.lock_sender(&sender).await;
    let session = state.sessions.create_or_get(&sender).await;
    info!(session_id = %session.session_id, sender = %sender, "Operator query");
    log_entry(state, ConversationEntry::inbound(&session.session_id, &sender, query)).await;

    Ok(state.orchestrator.invoke(&session, query).await?)
}

/// Send `text`, logging it against the session when there is one.
/// Delivery failures are already logged and counted by `Delivery`.
async fn reply(state: &AppState, sender: &str, session_id: Option<&str>, text: &str) {
    if state.delivery.send(sender, text).await.is_err() {
        return;
    }
    if let Some(session_id) = session_id {
        log_entry(state, ConversationEntry::outbound(session_id, sender, text)).await;
    }
}

async fn log_entry(state: &AppState, entry: ConversationEntry) {
    let Some(db) = &state.db else { return };
    if let Err(e) = db.log_conversation(&entry).await {
        warn!(session_id = %entry.session_id, error = %e, "Failed to log conversation");
    }
}
