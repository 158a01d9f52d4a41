//! Metric names and the Prometheus recorder.
//!
//! Instrumented code records through the `metrics` facade macros using the
//! names below; `/metrics` renders whatever the installed recorder collected.

use std::sync::OnceLock;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};

/// Inbound webhook metrics
pub mod webhook {
    /// POSTs received on the webhook, labelled by `outcome`
    pub const REQUESTS_TOTAL: &str = "compliance_webhook_requests_total";
    /// Messages handed to the dispatcher
    pub const MESSAGES_ENQUEUED_TOTAL: &str = "compliance_webhook_messages_enqueued_total";
    /// Messages dropped as redeliveries
    pub const DUPLICATES_TOTAL: &str = "compliance_webhook_duplicates_total";
}

/// Rate limiter metrics
pub mod rate_limit {
    pub const REJECTIONS_TOTAL: &str = "compliance_rate_limit_rejections_total";
}

/// Pipeline metrics
pub mod workflow {
    /// Latency of a single stage attempt, labelled by `stage`
    pub const STAGE_DURATION_SECONDS: &str = "compliance_stage_duration_seconds";
    /// Stage failures, labelled by `stage` and `kind`
    pub const STAGE_ERRORS_TOTAL: &str = "compliance_stage_errors_total";
    /// Retries after a transient stage failure, labelled by `stage`
    pub const STAGE_RETRIES_TOTAL: &str = "compliance_stage_retries_total";
    /// Finished runs, labelled by `outcome`
    pub const RUNS_TOTAL: &str = "compliance_workflow_runs_total";
}

/// Session metrics
pub mod session {
    pub const CREATED_TOTAL: &str = "compliance_sessions_created_total";
    pub const EXPIRED_TOTAL: &str = "compliance_sessions_expired_total";
    /// Sessions currently held in memory
    pub const ACTIVE: &str = "compliance_sessions_active";
}

/// Outbound delivery metrics
pub mod delivery {
    pub const SENT_TOTAL: &str = "compliance_delivery_sent_total";
    pub const FAILURES_TOTAL: &str = "compliance_delivery_failures_total";
}

/// Histogram buckets for stage latency. Agent calls are slow.
const STAGE_BUCKETS: [f64; 10] = [0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0];

static HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global Prometheus recorder once per process.
///
/// Returns `None` when another recorder is already installed; metrics are
/// then recorded there and `/metrics` renders nothing.
pub fn init_prometheus() -> Option<PrometheusHandle> {
    HANDLE
        .get_or_init(|| {
            let builder = match PrometheusBuilder::new().set_buckets_for_metric(
                Matcher::Full(workflow::STAGE_DURATION_SECONDS.to_string()),
                &STAGE_BUCKETS,
            ) {
                Ok(builder) => builder,
                Err(e) => {
                    warn!(error = %e, "Invalid histogram buckets, using defaults");
                    PrometheusBuilder::new()
                }
            };
            match builder.install_recorder() {
                Ok(handle) => {
                    info!("Prometheus metrics recorder installed");
                    Some(handle)
                }
                Err(e) => {
                    warn!(error = %e, "Metrics recorder not installed");
                    None
                }
            }
        })
        .clone()
}
