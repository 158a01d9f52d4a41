//! Stage client: the seam between the orchestrator and the hosted AI agents.
//!
//! The orchestrator only sees [`StageClient`]. [`OrchestrateClient`] is the
//! HTTP implementation that talks to the orchestration service's
//! chat-completions endpoint, one agent per stage.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::OrchestrateConfig;
use crate::error::StageError;
use crate::workflow::types::Stage;

/// Input for one stage call.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub stage: Stage,
    pub session_id: String,
    /// Validated output of the previous stage (or the user message for classification).
    pub input: Value,
}

/// Invokes a single pipeline stage and returns its raw JSON output.
#[async_trait]
pub trait StageClient: Send + Sync {
    async fn call(&self, request: &StageRequest) -> Result<Value, StageError>;
}

/// HTTP client for the hosted orchestration service.
pub struct OrchestrateClient {
    config: OrchestrateConfig,
    client: reqwest::Client,
}

impl OrchestrateClient {
    pub fn new(config: OrchestrateConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn agent_for(&self, stage: Stage) -> &str {
        match stage {
            Stage::Classification => &self.config.classifier_agent,
            Stage::RegulatoryMapping => &self.config.mapper_agent,
            Stage::Synthesis => &self.config.synthesizer_agent,
            Stage::Planning => &self.config.planner_agent,
        }
    }

    fn completions_url(&self, stage: Stage) -> String {
        format!(
            "{}/api/v1/orchestrate/{}/chat/completions",
            self.config.base_url,
            self.agent_for(stage)
        )
    }

    fn body(&self, request: &StageRequest) -> Value {
        let text = match &request.input {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        json!({
            "messages": [{
                "role": "user",
                "content": [{ "response_type": "text", "text": text }]
            }],
            "additional_parameters": { "project_id": self.config.project_id },
            "context": { "session_id": request.session_id, "stage": request.stage.label() },
            "stream": false
        })
    }
}

#[async_trait]
impl StageClient for OrchestrateClient {
    async fn call(&self, request: &StageRequest) -> Result<Value, StageError> {
        let stage = request.stage;
        let resp = self
            .client
            .post(self.completions_url(stage))
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    StageError::Transient {
                        stage,
                        reason: e.to_string(),
                    }
                } else {
                    StageError::Rejected {
                        stage,
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = resp.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = resp.text().await.unwrap_or_default();
            warn!(%stage, status = status.as_u16(), "Stage call failed (transient)");
            return Err(StageError::Transient {
                stage,
                reason: format!("HTTP {status}: {}", truncate(&body, 200)),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StageError::Rejected {
                stage,
                reason: format!("HTTP {status}: {}", truncate(&body, 200)),
            });
        }

        let envelope: Value = resp.json().await.map_err(|e| StageError::SchemaValidation {
            stage,
            reason: format!("response body is not JSON: {e}"),
        })?;
        debug!(%stage, "Stage call returned");

        let text = extract_text(&envelope).ok_or_else(|| StageError::SchemaValidation {
            stage,
            reason: "response has no text content block".into(),
        })?;
        parse_agent_json(&text).ok_or_else(|| StageError::SchemaValidation {
            stage,
            reason: format!("agent reply is not JSON: {}", truncate(&text, 120)),
        })
    }
}

/// Pull the first text block out of a chat-completions envelope.
///
/// Accepts both `content: [{response_type: "text", text}]` and `content: "..."`.
fn extract_text(envelope: &Value) -> Option<String> {
    let content = envelope
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?;

    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => blocks.iter().find_map(|block| {
            let is_text = block
                .get("response_type")
                .and_then(Value::as_str)
                .is_none_or(|t| t == "text");
            if is_text {
                block.get("text").and_then(Value::as_str).map(str::to_string)
            } else {
                None
            }
        }),
        _ => None,
    }
}

/// Parse the agent's reply as JSON, falling back to the outermost `{...}` span
/// when the agent wrapped the object in prose.
fn parse_agent_json(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        if value.is_object() {
            return Some(value);
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end])
        .ok()
        .filter(Value::is_object)
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_text_block() {
        let envelope = json!({
            "choices": [{"message": {"content": [
                {"response_type": "image", "url": "x"},
                {"response_type": "text", "text": "{\"a\":1}"}
            ]}}]
        });
        assert_eq!(extract_text(&envelope).as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn extracts_plain_string_content() {
        let envelope = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(extract_text(&envelope).as_deref(), Some("hello"));
    }

    #[test]
    fn missing_choices_yields_none() {
        assert!(extract_text(&json!({"id": "x"})).is_none());
    }

    #[test]
    fn parses_json_wrapped_in_prose() {
        let text = "Here is the result:\n{\"requirements\": []}\nThanks!";
        assert_eq!(parse_agent_json(text), Some(json!({"requirements": []})));
    }

    #[test]
    fn rejects_non_object_json() {
        assert!(parse_agent_json("[1,2,3]").is_none());
        assert!(parse_agent_json("no json here").is_none());
    }

    #[test]
    fn url_uses_stage_agent() {
        let client = OrchestrateClient::new(OrchestrateConfig {
            base_url: "http://orch".into(),
            api_key: secrecy::SecretString::from("k"),
            project_id: "p".into(),
            classifier_agent: "cls".into(),
            mapper_agent: "map".into(),
            synthesizer_agent: "syn".into(),
            planner_agent: "plan".into(),
        });
        assert_eq!(
            client.completions_url(Stage::RegulatoryMapping),
            "http://orch/api/v1/orchestrate/map/chat/completions"
        );
        let body = client.body(&StageRequest {
            stage: Stage::Classification,
            session_id: "s1".into(),
            input: Value::String("I sell electronics".into()),
        });
        assert_eq!(body["messages"][0]["content"][0]["text"], "I sell electronics");
        assert_eq!(body["context"]["stage"], "classification");
    }
}
