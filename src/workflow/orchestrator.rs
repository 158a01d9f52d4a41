//! Four-stage pipeline executor.
//!
//! A run walks `PipelineState` from `Classifying` to `Done`, one stage per
//! step. Each stage attempt is bounded by the stage timeout and transient
//! failures are retried on the backoff schedule. The whole run is bounded by
//! the overall deadline; any failure moves the session to `Failed`.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashSet;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::config::WorkflowConfig;
use crate::error::{StageError, WorkflowError};
use crate::metrics::workflow as workflow_metrics;
use crate::session::{Session, SessionManager, SessionState};
use crate::workflow::client::{StageClient, StageRequest};
use crate::workflow::retry::RetryPolicy;
use crate::workflow::types::{
    Classification, ComplianceRequirement, ComplianceRoadmap, Plan, Stage, Synthesis,
};
use crate::workflow::validate;

/// Where a run is, carrying everything the next stage needs.
enum PipelineState {
    Classifying {
        message: String,
    },
    Mapping {
        classification: Classification,
    },
    Synthesizing {
        classification: Classification,
        requirements: Vec<ComplianceRequirement>,
    },
    Planning {
        classification: Classification,
        requirements: Vec<ComplianceRequirement>,
        synthesis: Synthesis,
    },
    Done(ComplianceRoadmap),
}

impl Stage {
    /// Session state held while this stage runs.
    fn session_state(self) -> SessionState {
        match self {
            Stage::Classification => SessionState::Classifying,
            Stage::RegulatoryMapping => SessionState::Mapping,
            Stage::Synthesis => SessionState::Synthesizing,
            Stage::Planning => SessionState::Planning,
        }
    }
}

/// Removes the session from the active set when the run ends or is dropped.
struct RunGuard<'a> {
    active: &'a DashSet<String>,
    session_id: String,
}

impl<'a> RunGuard<'a> {
    fn acquire(active: &'a DashSet<String>, session_id: &str) -> Result<Self, WorkflowError> {
        if !active.insert(session_id.to_string()) {
            return Err(WorkflowError::AlreadyRunning {
                session_id: session_id.to_string(),
            });
        }
        Ok(Self {
            active,
            session_id: session_id.to_string(),
        })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.session_id);
    }
}

pub struct Orchestrator {
    client: Arc<dyn StageClient>,
    sessions: Arc<SessionManager>,
    config: WorkflowConfig,
    retry: RetryPolicy,
    active: DashSet<String>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn StageClient>,
        sessions: Arc<SessionManager>,
        config: WorkflowConfig,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            client,
            sessions,
            config,
            retry,
            active: DashSet::new(),
        }
    }

    /// Run the pipeline for `message` on `session`.
    ///
    /// On success the roadmap is stored on the session, which is now
    /// `Complete`. On any failure except `AlreadyRunning` the session is
    /// `Failed`.
    pub async fn invoke(
        &self,
        session: &Session,
        message: &str,
    ) -> Result<ComplianceRoadmap, WorkflowError> {
        let _guard = RunGuard::acquire(&self.active, &session.session_id)?;
        let started = Instant::now();
        info!(session_id = %session.session_id, sender = %session.sender, "Workflow started");

        // The deadline bounds the stages only. Completion runs to the end so
        // the roadmap and the Complete state always land together.
        let deadline = self.config.overall_deadline;
        let result = match tokio::time::timeout(deadline, self.run(session, message)).await {
            Ok(result) => result,
            Err(_) => Err(WorkflowError::Timeout { deadline }),
        };
        let result = match result {
            Ok(roadmap) => self
                .sessions
                .complete(&session.sender, roadmap.clone())
                .await
                .map(|_| roadmap)
                .map_err(WorkflowError::from),
            Err(e) => Err(e),
        };

        match &result {
            Ok(roadmap) => {
                metrics::counter!(workflow_metrics::RUNS_TOTAL, "outcome" => "complete").increment(1);
                info!(
                    session_id = %session.session_id,
                    steps = roadmap.compliance_steps().len(),
                    total_cost = roadmap.total_estimated_cost(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Workflow complete"
                );
            }
            Err(e) => {
                let outcome = match e {
                    WorkflowError::Timeout { .. } => "timeout",
                    _ => "failed",
                };
                metrics::counter!(workflow_metrics::RUNS_TOTAL, "outcome" => outcome).increment(1);
                error!(
                    session_id = %session.session_id,
                    stage = e.stage().map(|s| s.label()).unwrap_or("none"),
                    error = %e,
                    "Workflow failed"
                );
                self.mark_failed(session).await;
            }
        }

        result
    }

    /// Whether a run is in flight for this session.
    pub fn is_running(&self, session_id: &str) -> bool {
        self.active.contains(session_id)
    }

    async fn run(
        &self,
        session: &Session,
        message: &str,
    ) -> Result<ComplianceRoadmap, WorkflowError> {
        let mut state = PipelineState::Classifying {
            message: message.to_string(),
        };

        loop {
            state = match state {
                PipelineState::Classifying { message } => {
                    let classification = self
                        .stage(session, Stage::Classification, Value::String(message), |raw| {
                            validate::classification(raw)
                        })
                        .await?;
                    self.sessions
                        .record_classification(&session.sender, &classification)
                        .await?;
                    PipelineState::Mapping { classification }
                }

                PipelineState::Mapping { classification } => {
                    let input = json!({ "classification": classification });
                    let mapping = self
                        .stage(session, Stage::RegulatoryMapping, input, |raw| {
                            validate::regulatory_mapping(raw)
                        })
                        .await?;
                    PipelineState::Synthesizing {
                        classification,
                        requirements: mapping.requirements,
                    }
                }

                PipelineState::Synthesizing {
                    classification,
                    requirements,
                } => {
                    let input = json!({
                        "classification": classification,
                        "requirements": requirements,
                    });
                    let synthesis = self
                        .stage(session, Stage::Synthesis, input, |raw| {
                            validate::synthesis(raw, &requirements)
                        })
                        .await?;
                    PipelineState::Planning {
                        classification,
                        requirements,
                        synthesis,
                    }
                }

                PipelineState::Planning {
                    classification,
                    requirements,
                    synthesis,
                } => {
                    let input = json!({
                        "session_id": session.session_id,
                        "classification": classification,
                        "requirements": requirements,
                        "detailed_steps": synthesis.detailed_steps,
                    });
                    let plan = self
                        .stage(session, Stage::Planning, input, |raw| {
                            validate::plan(raw, &requirements)
                        })
                        .await?;
                    PipelineState::Done(assemble(session, &classification, requirements, plan))
                }

                PipelineState::Done(roadmap) => return Ok(roadmap),
            };
        }
    }

    /// Enter `stage`, call it with retries and validate its output.
    async fn stage<T, F>(
        &self,
        session: &Session,
        stage: Stage,
        input: Value,
        validate: F,
    ) -> Result<T, WorkflowError>
    where
        F: Fn(Value) -> Result<T, StageError>,
    {
        self.sessions
            .transition(&session.sender, stage.session_state())
            .await?;

        let request = StageRequest {
            stage,
            session_id: session.session_id.clone(),
            input,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self.attempt(&request, attempt).await.and_then(&validate);

            let err = match outcome {
                Ok(output) => {
                    debug!(session_id = %session.session_id, %stage, attempt, "Stage succeeded");
                    return Ok(output);
                }
                Err(err) => err,
            };

            let kind = match &err {
                StageError::Transient { .. } => "transient",
                StageError::SchemaValidation { .. } => "schema",
                StageError::Rejected { .. } => "rejected",
            };
            metrics::counter!(
                workflow_metrics::STAGE_ERRORS_TOTAL,
                "stage" => stage.label(),
                "kind" => kind
            )
            .increment(1);

            let delay = if err.is_transient() {
                self.retry.delay_for(attempt)
            } else {
                None
            };
            let Some(delay) = delay else {
                if err.is_transient() {
                    warn!(
                        session_id = %session.session_id,
                        %stage,
                        max_attempts = self.retry.max_attempts(),
                        "Stage retries exhausted"
                    );
                }
                return Err(WorkflowError::FatalStage {
                    stage,
                    attempts: attempt,
                    source: err,
                });
            };

            warn!(
                session_id = %session.session_id,
                %stage,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Stage failed, retrying"
            );
            metrics::counter!(workflow_metrics::STAGE_RETRIES_TOTAL, "stage" => stage.label())
                .increment(1);
            tokio::time::sleep(delay).await;
        }
    }

    /// One bounded call. A timeout drops the in-flight request.
    async fn attempt(&self, request: &StageRequest, attempt: u32) -> Result<Value, StageError> {
        let stage = request.stage;
        let started = Instant::now();
        let result =
            match tokio::time::timeout(self.config.stage_timeout, self.client.call(request)).await
            {
                Ok(result) => result,
                Err(_) => Err(StageError::Transient {
                    stage,
                    reason: format!(
                        "attempt {attempt} timed out after {}ms",
                        self.config.stage_timeout.as_millis()
                    ),
                }),
            };
        metrics::histogram!(workflow_metrics::STAGE_DURATION_SECONDS, "stage" => stage.label())
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn mark_failed(&self, session: &Session) {
        if let Err(e) = self
            .sessions
            .transition(&session.sender, SessionState::Failed)
            .await
        {
            warn!(session_id = %session.session_id, error = %e, "Could not mark session failed");
        }
    }
}

/// Build the roadmap from the plan. Totals always come from the steps.
fn assemble(
    session: &Session,
    classification: &Classification,
    requirements: Vec<ComplianceRequirement>,
    plan: Plan,
) -> ComplianceRoadmap {
    let referenced: Vec<ComplianceRequirement> = requirements
        .into_iter()
        .filter(|r| {
            plan.compliance_steps
                .iter()
                .any(|s| s.requirement_id == r.requirement_id)
        })
        .collect();

    let roadmap = ComplianceRoadmap::new(
        session.session_id.clone(),
        plan.compliance_steps,
        referenced,
        classification.business_type.clone(),
        classification.location.clone(),
    );

    if let Some(reported) = plan.total_estimated_cost {
        if reported != roadmap.total_estimated_cost() {
            warn!(
                session_id = %session.session_id,
                reported,
                computed = roadmap.total_estimated_cost(),
                "Planner total cost disagrees with steps; using computed total"
            );
        }
    }
    if let Some(reported) = plan.total_timeline_days {
        if reported != roadmap.total_timeline_days() {
            debug!(
                session_id = %session.session_id,
                reported,
                computed = roadmap.total_timeline_days(),
                "Planner timeline disagrees with steps; using computed total"
            );
        }
    }

    roadmap
}
