//! Configuration loading
//!
//! Sections can come from a TOML/JSON/YAML file with `ESCROW__SECTION__KEY`
//! environment overrides, or from flat `ESCROW_*` variables (with `.env`
//! support) for deployments without a file.

use crate::budget::{BudgetConfig, ReleasePolicy};
use crate::condensation::{CondensationConfig, ReflectorConfig};
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub condensation: CondensationConfig,

    #[serde(default)]
    pub reflector: ReflectorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Directory for persisted agent state; `None` disables persistence
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl Config {
    /// Load from a file, then apply `ESCROW__` environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());

        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix("ESCROW")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load from flat `ESCROW_*` variables, reading `.env` first if present
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = Config::default();

        if let Some(v) = env_var("ESCROW_ROOT_BUDGET") {
            config.budget.root_budget = Some(parse_value("ESCROW_ROOT_BUDGET", &v)?);
        }
        if let Some(v) = env_var("ESCROW_WARNING_THRESHOLD") {
            config.budget.warning_threshold = parse_value("ESCROW_WARNING_THRESHOLD", &v)?;
        }
        if let Some(v) = env_var("ESCROW_MIN_ACTION_COST") {
            config.budget.min_action_cost = parse_value("ESCROW_MIN_ACTION_COST", &v)?;
        }
        if let Some(v) = env_var("ESCROW_RELEASE_POLICY") {
            config.budget.release_policy = parse_release_policy(&v)?;
        }

        if let Some(v) = env_var("ESCROW_TRIGGER_FRACTION") {
            config.condensation.trigger_fraction = parse_value("ESCROW_TRIGGER_FRACTION", &v)?;
        }
        if let Some(v) = env_var("ESCROW_CONTEXT_LIMIT") {
            config.condensation.default_context_limit = parse_value("ESCROW_CONTEXT_LIMIT", &v)?;
        }
        if let Some(v) = env_var("ESCROW_REFLECTION_TIMEOUT_MS") {
            config.condensation.reflection_timeout_ms =
                parse_value("ESCROW_REFLECTION_TIMEOUT_MS", &v)?;
        }

        if let Some(v) = env_var("ESCROW_REFLECTOR_ENABLED") {
            config.reflector.enabled = parse_value("ESCROW_REFLECTOR_ENABLED", &v)?;
        }
        if let Some(v) = env_var("ESCROW_REFLECTOR_ENDPOINT") {
            config.reflector.endpoint = v;
        }
        config.reflector.api_key = env_var("ESCROW_REFLECTOR_API_KEY").or(config.reflector.api_key);
        config.reflector.model = env_var("ESCROW_REFLECTOR_MODEL").or(config.reflector.model);

        if let Some(v) = env_var("ESCROW_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = env_var("ESCROW_LOG_JSON") {
            config.logging.json = parse_value("ESCROW_LOG_JSON", &v)?;
        }

        config.state_dir = env_var("ESCROW_STATE_DIR").map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fraction = self.condensation.trigger_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::invalid(
                "condensation.trigger_fraction",
                format!("{} is not in (0, 1]", fraction),
            ));
        }

        let similarity = self.condensation.similarity_threshold;
        if !(0.0..=1.0).contains(&similarity) {
            return Err(ConfigError::invalid(
                "condensation.similarity_threshold",
                format!("{} is not in [0, 1]", similarity),
            ));
        }

        if self.condensation.default_context_limit == 0 {
            return Err(ConfigError::invalid(
                "condensation.default_context_limit",
                "must be positive",
            ));
        }

        if let Some(root) = self.budget.root_budget {
            if root.is_negative() {
                return Err(ConfigError::invalid("budget.root_budget", "must not be negative"));
            }
        }

        if self.budget.min_action_cost.is_negative() {
            return Err(ConfigError::invalid(
                "budget.min_action_cost",
                "must not be negative",
            ));
        }

        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string()))
}

fn parse_release_policy(raw: &str) -> Result<ReleasePolicy, ConfigError> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_lowercase()))
        .map_err(|e| ConfigError::invalid("ESCROW_RELEASE_POLICY", e.to_string()))
}
