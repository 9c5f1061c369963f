use crate::error::AppError;
use crate::utils::RetryPolicy;

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Service configuration, read from the environment (after `.env` is loaded).
#[derive(Debug, Clone)]
pub struct Config {
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub bind_addr: String,
    /// Externally reachable base URL used for provider callbacks.
    pub public_base_url: String,
    pub log_level: String,
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub deepgram_api_key: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub ring_timeout_secs: u32,
    pub settings: OrchestratorSettings,
}

/// The subset of configuration the orchestration components consume.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Number outbound calls are placed from.
    pub caller_id: String,
    pub dispatch_interval: Duration,
    pub provider_timeout: Duration,
    pub retry: RetryPolicy,
    pub inbound_user_id: Uuid,
    pub inbound_company_id: Uuid,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            caller_id: String::new(),
            dispatch_interval: Duration::from_secs(5),
            provider_timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
            inbound_user_id: Uuid::nil(),
            inbound_company_id: Uuid::nil(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_vars(&env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, AppError> {
        let vars = Vars(vars);
        let retry = RetryPolicy {
            max_attempts: vars.parsed_or("RETRY_MAX_ATTEMPTS", 3)?,
            base_delay: Duration::from_millis(vars.parsed_or("RETRY_BASE_DELAY_MILLIS", 500)?),
        };
        if retry.max_attempts == 0 {
            return Err(AppError::Config("RETRY_MAX_ATTEMPTS must be at least 1".into()));
        }
        let settings = OrchestratorSettings {
            caller_id: vars.required("TWILIO_CALLER_ID")?,
            dispatch_interval: Duration::from_secs(vars.parsed_or("DISPATCH_INTERVAL_SECS", 5)?),
            provider_timeout: Duration::from_secs(vars.parsed_or("PROVIDER_TIMEOUT_SECS", 15)?),
            retry,
            inbound_user_id: vars.parsed_or("INBOUND_USER_ID", Uuid::nil())?,
            inbound_company_id: vars.parsed_or("INBOUND_COMPANY_ID", Uuid::nil())?,
        };

        Ok(Self {
            database_url: vars.optional("DATABASE_URL"),
            bind_addr: vars.optional("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            public_base_url: vars
                .required("PUBLIC_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            log_level: vars.optional("LOG_LEVEL").unwrap_or_else(|| "debug".to_string()),
            twilio_account_sid: vars.required("TWILIO_ACCOUNT_SID")?,
            twilio_auth_token: vars.required("TWILIO_AUTH_TOKEN")?,
            deepgram_api_key: vars.required("DEEPGRAM_API_KEY")?,
            openai_api_key: vars.required("OPENAI_API_KEY")?,
            openai_model: vars
                .optional("OPENAI_MODEL")
                .unwrap_or_else(|| "gpt-3.5-turbo".to_string()),
            ring_timeout_secs: vars.parsed_or("RING_TIMEOUT_SECS", 30)?,
            settings,
        })
    }
}

struct Vars<'a>(&'a HashMap<String, String>);

impl Vars<'_> {
    fn optional(&self, key: &str) -> Option<String> {
        self.0
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, AppError> {
        self.optional(key)
            .ok_or_else(|| AppError::Config(format!("{key} not set")))
    }

    fn parsed_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, AppError> {
        match self.optional(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| AppError::Config(format!("{key} has invalid value '{raw}'"))),
            None => Ok(default),
        }
    }
}
