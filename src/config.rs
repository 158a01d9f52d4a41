//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Token-bucket settings applied per sender.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sustained rate in messages per minute.
    pub per_minute: u32,
    /// Bucket capacity (maximum burst).
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 10,
            burst: 20,
        }
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sessions idle for longer than this are expired by the sweep.
    pub inactivity_window: Duration,
    /// How often the sweep runs.
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_window: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Retry and timeout budget for a pipeline run.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Hard limit on a single stage attempt.
    pub stage_timeout: Duration,
    /// Hard limit on the whole four-stage run.
    pub overall_deadline: Duration,
    /// Retries after the first attempt (so 3 means up to 4 calls).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub backoff_base: Duration,
    /// Growth factor applied to the delay on each retry.
    pub backoff_multiplier: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(30),
            overall_deadline: Duration::from_secs(150),
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_multiplier: 2,
        }
    }
}

/// Outbound delivery retry settings.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// WhatsApp Business Cloud API settings.
#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub access_token: SecretString,
    pub phone_number_id: String,
    pub api_version: String,
    /// Token echoed back during the webhook verification handshake.
    pub verify_token: SecretString,
    /// When set, inbound bodies must carry a valid `X-Hub-Signature-256`.
    pub app_secret: Option<SecretString>,
}

/// External AI orchestration service settings.
#[derive(Debug, Clone)]
pub struct OrchestrateConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub project_id: String,
    pub classifier_agent: String,
    pub mapper_agent: String,
    pub synthesizer_agent: String,
    pub planner_agent: String,
}

/// Complete application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_path: PathBuf,
    /// Bearer token for the operator API. `None` disables those routes.
    pub admin_token: Option<SecretString>,
    /// How long a message id is remembered for duplicate suppression.
    pub dedup_window: Duration,
    pub whatsapp: WhatsAppConfig,
    pub orchestrate: OrchestrateConfig,
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
    pub workflow: WorkflowConfig,
    pub delivery: DeliveryConfig,
}

impl AppConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        let whatsapp = WhatsAppConfig {
            access_token: env.secret("WHATSAPP_ACCESS_TOKEN")?,
            phone_number_id: env.required("WHATSAPP_PHONE_NUMBER_ID")?,
            api_version: env.or("WHATSAPP_API_VERSION", "v18.0"),
            verify_token: env.secret("WHATSAPP_WEBHOOK_VERIFY_TOKEN")?,
            app_secret: env.optional("WHATSAPP_APP_SECRET").map(SecretString::from),
        };

        let orchestrate = OrchestrateConfig {
            base_url: env
                .or("ORCHESTRATE_BASE_URL", "https://api.watsonx.orchestrate.ibm.com")
                .trim_end_matches('/')
                .to_string(),
            api_key: env.secret("ORCHESTRATE_API_KEY")?,
            project_id: env.required("ORCHESTRATE_PROJECT_ID")?,
            classifier_agent: env.or("ORCHESTRATE_CLASSIFIER_AGENT", "intent_classifier"),
            mapper_agent: env.or("ORCHESTRATE_MAPPER_AGENT", "regulatory_mapper_agent"),
            synthesizer_agent: env.or("ORCHESTRATE_SYNTHESIZER_AGENT", "data_synthesizer"),
            planner_agent: env.or("ORCHESTRATE_PLANNER_AGENT", "personalized_planner_agent"),
        };

        let rate_defaults = RateLimitConfig::default();
        let rate_limit = RateLimitConfig {
            per_minute: env.parse("RATE_LIMIT_PER_MINUTE", rate_defaults.per_minute)?,
            burst: env.parse("RATE_LIMIT_BURST", rate_defaults.burst)?,
        };
        if rate_limit.burst == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RATE_LIMIT_BURST".into(),
                message: "must be at least 1".into(),
            });
        }

        let session_defaults = SessionConfig::default();
        let session = SessionConfig {
            inactivity_window: env.secs(
                "SESSION_INACTIVITY_SECS",
                session_defaults.inactivity_window,
            )?,
            sweep_interval: env.secs("SESSION_SWEEP_SECS", session_defaults.sweep_interval)?,
        };

        let wf = WorkflowConfig::default();
        let workflow = WorkflowConfig {
            stage_timeout: env.secs("WORKFLOW_STAGE_TIMEOUT_SECS", wf.stage_timeout)?,
            overall_deadline: env.secs("WORKFLOW_DEADLINE_SECS", wf.overall_deadline)?,
            max_retries: env.parse("WORKFLOW_MAX_RETRIES", wf.max_retries)?,
            backoff_base: Duration::from_millis(env.parse(
                "WORKFLOW_BACKOFF_BASE_MS",
                wf.backoff_base.as_millis() as u64,
            )?),
            backoff_multiplier: env.parse("WORKFLOW_BACKOFF_MULTIPLIER", wf.backoff_multiplier)?,
        };

        Ok(Self {
            port: env.parse("PORT", 8000)?,
            database_path: PathBuf::from(env.or("DATABASE_PATH", "./data/compliance-advisor.db")),
            admin_token: env.optional("ADMIN_API_TOKEN").map(SecretString::from),
            dedup_window: env.secs("WEBHOOK_DEDUP_SECS", Duration::from_secs(600))?,
            whatsapp,
            orchestrate,
            rate_limit,
            session,
            workflow,
            delivery: DeliveryConfig::default(),
        })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn secret(&self, key: &str) -> Result<SecretString, ConfigError> {
        self.required(key).map(SecretString::from)
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("WHATSAPP_ACCESS_TOKEN", "wa-token"),
            ("WHATSAPP_PHONE_NUMBER_ID", "1234"),
            ("WHATSAPP_WEBHOOK_VERIFY_TOKEN", "verify-me"),
            ("ORCHESTRATE_API_KEY", "orch-key"),
            ("ORCHESTRATE_PROJECT_ID", "proj"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_applied() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.rate_limit.per_minute, 10);
        assert_eq!(config.rate_limit.burst, 20);
        assert_eq!(config.workflow.max_retries, 3);
        assert_eq!(config.workflow.backoff_base, Duration::from_secs(1));
        assert_eq!(config.whatsapp.api_version, "v18.0");
        assert_eq!(config.whatsapp.verify_token.expose_secret(), "verify-me");
        assert!(config.whatsapp.app_secret.is_none());
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn missing_required_var() {
        let mut env = base_env();
        env.remove("ORCHESTRATE_API_KEY");
        match load(&env) {
            Err(ConfigError::MissingEnvVar(key)) => assert_eq!(key, "ORCHESTRATE_API_KEY"),
            other => panic!("expected MissingEnvVar, got {other:?}"),
        }
    }

    #[test]
    fn invalid_number_rejected() {
        let mut env = base_env();
        env.insert("RATE_LIMIT_BURST", "lots");
        assert!(matches!(
            load(&env),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn zero_burst_rejected() {
        let mut env = base_env();
        env.insert("RATE_LIMIT_BURST", "0");
        assert!(load(&env).is_err());
    }

    #[test]
    fn overrides_and_trailing_slash() {
        let mut env = base_env();
        env.insert("ORCHESTRATE_BASE_URL", "http://localhost:9000/");
        env.insert("WORKFLOW_BACKOFF_BASE_MS", "250");
        env.insert("SESSION_INACTIVITY_SECS", "120");
        let config = load(&env).unwrap();
        assert_eq!(config.orchestrate.base_url, "http://localhost:9000");
        assert_eq!(config.workflow.backoff_base, Duration::from_millis(250));
        assert_eq!(config.session.inactivity_window, Duration::from_secs(120));
    }
}
