//! Shared fixtures for integration tests: a scripted stage client, a
//! recording outbound channel and an `AppState` builder.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use compliance_advisor::channels::OutboundChannel;
use compliance_advisor::config::AppConfig;
use compliance_advisor::error::{ChannelError, StageError};
use compliance_advisor::state::AppState;
use compliance_advisor::store::{Database, LibSqlBackend};
use compliance_advisor::webhook::InboundMessage;
use compliance_advisor::workflow::types::Stage;
use compliance_advisor::workflow::{StageClient, StageRequest};

/// Maximum time any wait in a test may take before it is considered hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub const VERIFY_TOKEN: &str = "verify-me";
pub const APP_SECRET: &str = "app-secret";
pub const ADMIN_TOKEN: &str = "admin-token";

// ── Stage client ────────────────────────────────────────────────────

/// Answers every stage with the Westlands electronics shop fixtures.
/// Each call sleeps for `delay` and tracks how many calls overlap.
#[derive(Default)]
pub struct StubStages {
    pub delay: Duration,
    /// Fail every planning call with a transient error.
    pub planner_down: bool,
    pub calls: Mutex<Vec<(Stage, String)>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl StubStages {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn calls_for(&self, stage: Stage) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == stage)
            .count()
    }

    pub fn max_overlap(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageClient for StubStages {
    async fn call(&self, request: &StageRequest) -> Result<Value, StageError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.stage, request.session_id.clone()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match request.stage {
            Stage::Classification => Ok(classification()),
            Stage::RegulatoryMapping => Ok(mapping()),
            Stage::Synthesis => Ok(json!({ "detailed_steps": steps() })),
            Stage::Planning if self.planner_down => Err(StageError::Transient {
                stage: Stage::Planning,
                reason: "HTTP 503".into(),
            }),
            Stage::Planning => Ok(json!({
                "session_id": request.session_id,
                "compliance_steps": steps(),
                "total_estimated_cost": 999_999,
                "total_timeline_days": 15
            })),
        }
    }
}

pub fn classification() -> Value {
    json!({
        "business_type": "Electronics Retail",
        "location": "Nairobi",
        "specific_area": "Westlands",
        "products": ["phones", "laptops"],
        "confidence_score": 0.94
    })
}

pub fn mapping() -> Value {
    json!({ "requirements": [
        {"requirement_id": "sbp", "name": "Single Business Permit",
         "authority": "Nairobi City County", "category": "mandatory"},
        {"requirement_id": "kra_pin", "name": "KRA PIN",
         "authority": "Kenya Revenue Authority", "category": "mandatory"},
        {"requirement_id": "fire", "name": "Fire Safety Certificate",
         "authority": "Nairobi Fire Department", "category": "conditional"}
    ]})
}

pub fn steps() -> Value {
    json!([
        {"step_number": 1, "title": "Register for KRA PIN",
         "description": "Register on the iTax portal", "cost": 0, "timeline_days": 1,
         "authority": "Kenya Revenue Authority", "documents_required": ["National ID"],
         "requirement_id": "kra_pin"},
        {"step_number": 2, "title": "Apply for Single Business Permit",
         "description": "Apply through the county e-permit portal", "cost": 5000,
         "timeline_days": 7, "authority": "Nairobi City County",
         "documents_required": ["KRA PIN certificate", "Lease agreement"],
         "requirement_id": "sbp"},
        {"step_number": 3, "title": "Obtain Fire Safety Certificate",
         "description": "Book an inspection of the premises", "cost": 3500,
         "timeline_days": 7, "authority": "Nairobi Fire Department",
         "documents_required": [], "requirement_id": "fire"}
    ])
}

// ── Outbound channel ────────────────────────────────────────────────

/// Records every outbound message instead of sending it.
#[derive(Default)]
pub struct RecordingChannel {
    pub sent: Mutex<Vec<(String, String)>>,
}

impl RecordingChannel {
    pub fn texts_for(&self, recipient: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r == recipient)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Wait until at least `n` messages have gone out.
    pub async fn wait_for(&self, n: usize) {
        tokio::time::timeout(TEST_TIMEOUT, async {
            while self.count() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {n} outbound messages, saw {}", self.count()));
    }
}

#[async_trait]
impl OutboundChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, recipient: &str, text: &str) -> Result<(), ChannelError> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), text.to_string()));
        Ok(())
    }
}

// ── State ───────────────────────────────────────────────────────────

pub fn config(overrides: &[(&str, &str)]) -> AppConfig {
    let mut env: HashMap<String, String> = HashMap::from(
        [
            ("WHATSAPP_ACCESS_TOKEN", "wa-token"),
            ("WHATSAPP_PHONE_NUMBER_ID", "1234567890"),
            ("WHATSAPP_WEBHOOK_VERIFY_TOKEN", VERIFY_TOKEN),
            ("ORCHESTRATE_API_KEY", "orch-key"),
            ("ORCHESTRATE_PROJECT_ID", "proj"),
            ("WORKFLOW_BACKOFF_BASE_MS", "1"),
            ("WORKFLOW_STAGE_TIMEOUT_SECS", "2"),
            ("WORKFLOW_DEADLINE_SECS", "4"),
        ]
        .map(|(k, v)| (k.to_string(), v.to_string())),
    );
    for (k, v) in overrides {
        env.insert(k.to_string(), v.to_string());
    }
    AppConfig::from_lookup(|k| env.get(k).cloned()).unwrap()
}

pub struct Harness {
    pub state: AppState,
    pub rx: Option<mpsc::Receiver<InboundMessage>>,
    pub stages: Arc<StubStages>,
    pub channel: Arc<RecordingChannel>,
    pub db: Arc<dyn Database>,
}

impl Harness {
    pub async fn new(config: AppConfig, stages: StubStages) -> Self {
        let stages = Arc::new(stages);
        let channel = Arc::new(RecordingChannel::default());
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let (state, rx) = AppState::new(
            config,
            stages.clone(),
            channel.clone(),
            Some(Arc::clone(&db)),
            None,
        );
        Self {
            state,
            rx: Some(rx),
            stages,
            channel,
            db,
        }
    }
}

pub fn message(id: &str, sender: &str, text: &str) -> InboundMessage {
    InboundMessage {
        message_id: id.to_string(),
        sender: sender.to_string(),
        text: text.to_string(),
    }
}

/// A webhook body carrying one text message.
pub fn text_envelope(message_id: &str, from: &str, body: &str) -> String {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "WABA_ID",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "metadata": {"display_phone_number": "254700000000", "phone_number_id": "1234567890"},
                    "contacts": [{"profile": {"name": "Wanjiru"}, "wa_id": from}],
                    "messages": [{
                        "from": from, "id": message_id, "timestamp": "1700000000",
                        "type": "text", "text": {"body": body}
                    }]
                }
            }]
        }]
    })
    .to_string()
}
