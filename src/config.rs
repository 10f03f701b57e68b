//! Configuration management for the task engine.
//!
//! Configuration can be set via environment variables:
//! - `OPENROUTER_API_KEY` - Optional for the library, required by the binary.
//! - `DEFAULT_MODEL` - Optional. Model id. Defaults to `anthropic/claude-sonnet-4`.
//! - `OPENROUTER_BASE_URL` - Optional. Defaults to `https://openrouter.ai/api/v1`.
//! - `TASK_STORAGE_DIR` - Optional. Root of the file store. Defaults to `./.task_engine`.
//! - `WORKING_DIR` - Optional. Workspace directory. Defaults to the current directory.
//! - `DEFAULT_MODE` - Optional. Mode used when none is given. Defaults to `code`.
//! - `AUTO_RESUBMIT` - Optional. Retry failed requests automatically. Defaults to `true`.
//! - `RETRY_BASE_DELAY_SECS` - Optional. Backoff base. Defaults to `5`.
//! - `MAX_AUTO_RETRIES` - Optional. Retries before asking the caller. Unlimited by default.
//! - `REQUEST_DELAY_MS` - Optional. Minimum spacing between requests. Defaults to `0`.
//! - `MISTAKE_LIMIT` - Optional. Consecutive mistakes before asking. Defaults to `3`.
//! - `MAX_AUTO_APPROVED_REQUESTS` / `MAX_AUTO_APPROVED_COST` - Optional approval ceilings.
//! - `AUTO_CONDENSE` - Optional. Summarize instead of only truncating. Defaults to `true`.
//! - `CONDENSE_THRESHOLD_PERCENT` - Optional. Defaults to `80`, clamped to 5..=100.
//! - `CONTEXT_WINDOW` / `MAX_OUTPUT_TOKENS` - Optional model limits.
//! - `USAGE_DRAIN_TIMEOUT_MS` - Optional. Defaults to `5000`.
//! - `MODE_SWITCH_SETTLE_MS` - Optional. Defaults to `500`.
//! - `CHECKPOINTS_ENABLED` - Optional. Defaults to `false`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::task::Mode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Retry behaviour for failed API requests.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Retry first-chunk failures without asking
    pub auto_resubmit: bool,
    /// Base of the exponential backoff, in seconds
    pub base_delay_secs: u64,
    /// Automatic retries before falling back to asking the caller
    pub max_auto_retries: Option<u32>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            auto_resubmit: true,
            base_delay_secs: 5,
            max_auto_retries: None,
        }
    }
}

/// Ceilings enforced by the auto-approval gate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApprovalLimits {
    pub max_requests: Option<u32>,
    /// Cost ceiling in USD
    pub max_cost: Option<f64>,
}

/// Context window management settings.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub auto_condense: bool,
    pub condense_threshold_percent: u8,
    pub context_window: u64,
    pub max_output_tokens: u64,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            auto_condense: true,
            condense_threshold_percent: 80,
            context_window: 200_000,
            max_output_tokens: 8_192,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key
    pub api_key: Option<String>,

    /// Default model identifier (OpenRouter format)
    pub default_model: String,

    /// OpenRouter-compatible endpoint
    pub base_url: String,

    /// Directory holding persisted task state
    pub storage_dir: PathBuf,

    /// Workspace directory for tools and environment details
    pub working_dir: PathBuf,

    pub default_mode: Mode,

    pub retry: RetrySettings,

    /// Minimum spacing between any two requests across all tasks
    pub request_delay: Duration,

    pub mistake_limit: u32,

    pub approval: ApprovalLimits,

    pub context: ContextSettings,

    /// Upper bound for draining trailing usage data from an abandoned stream
    pub usage_drain_timeout: Duration,

    /// Pause after restoring a mode before the next tool runs
    pub mode_switch_settle: Duration,

    pub checkpoints_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            default_model: "anthropic/claude-sonnet-4".to_string(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            storage_dir: PathBuf::from(".task_engine"),
            working_dir: PathBuf::from("."),
            default_mode: Mode::default(),
            retry: RetrySettings::default(),
            request_delay: Duration::ZERO,
            mistake_limit: 3,
            approval: ApprovalLimits::default(),
            context: ContextSettings::default(),
            usage_drain_timeout: Duration::from_millis(5_000),
            mode_switch_settle: Duration::from_millis(500),
            checkpoints_enabled: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric or boolean variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let working_dir = std::env::var("WORKING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let threshold: u8 = env_parse("CONDENSE_THRESHOLD_PERCENT")?
            .unwrap_or(defaults.context.condense_threshold_percent);

        Ok(Self {
            api_key: std::env::var("OPENROUTER_API_KEY").ok(),
            default_model: std::env::var("DEFAULT_MODEL").unwrap_or(defaults.default_model),
            base_url: std::env::var("OPENROUTER_BASE_URL").unwrap_or(defaults.base_url),
            storage_dir: std::env::var("TASK_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            working_dir,
            default_mode: std::env::var("DEFAULT_MODE")
                .map(Mode::new)
                .unwrap_or(defaults.default_mode),
            retry: RetrySettings {
                auto_resubmit: env_bool("AUTO_RESUBMIT")?.unwrap_or(true),
                base_delay_secs: env_parse("RETRY_BASE_DELAY_SECS")?
                    .unwrap_or(defaults.retry.base_delay_secs),
                max_auto_retries: env_parse("MAX_AUTO_RETRIES")?,
            },
            request_delay: env_parse("REQUEST_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_delay),
            mistake_limit: env_parse("MISTAKE_LIMIT")?.unwrap_or(defaults.mistake_limit),
            approval: ApprovalLimits {
                max_requests: env_parse("MAX_AUTO_APPROVED_REQUESTS")?,
                max_cost: env_parse("MAX_AUTO_APPROVED_COST")?,
            },
            context: ContextSettings {
                auto_condense: env_bool("AUTO_CONDENSE")?.unwrap_or(true),
                condense_threshold_percent: threshold.clamp(5, 100),
                context_window: env_parse("CONTEXT_WINDOW")?
                    .unwrap_or(defaults.context.context_window),
                max_output_tokens: env_parse("MAX_OUTPUT_TOKENS")?
                    .unwrap_or(defaults.context.max_output_tokens),
            },
            usage_drain_timeout: env_parse("USAGE_DRAIN_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.usage_drain_timeout),
            mode_switch_settle: env_parse("MODE_SWITCH_SETTLE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.mode_switch_settle),
            checkpoints_enabled: env_bool("CHECKPOINTS_ENABLED")?.unwrap_or(false),
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(default_model: String, storage_dir: PathBuf, working_dir: PathBuf) -> Self {
        Self {
            default_model,
            storage_dir,
            working_dir,
            ..Self::default()
        }
    }

    /// The API key, or an error naming the variable that should hold it.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => parse_value(name, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => parse_bool(name, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e)))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("expected a boolean, got '{}'", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_accepts_common_spellings() {
        assert!(parse_bool("X", "yes").unwrap());
        assert!(parse_bool("X", " ON ").unwrap());
        assert!(!parse_bool("X", "0").unwrap());
        assert!(matches!(
            parse_bool("X", "maybe"),
            Err(ConfigError::InvalidValue(name, _)) if name == "X"
        ));
    }

    #[test]
    fn test_parse_value_reports_variable_name() {
        let parsed: u64 = parse_value("RETRY_BASE_DELAY_SECS", " 7 ").unwrap();
        assert_eq!(parsed, 7);

        let err = parse_value::<u32>("MISTAKE_LIMIT", "three").unwrap_err();
        assert!(err.to_string().contains("MISTAKE_LIMIT"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.retry.auto_resubmit);
        assert_eq!(config.retry.base_delay_secs, 5);
        assert_eq!(config.mistake_limit, 3);
        assert_eq!(config.default_mode.as_str(), "code");
        assert!(config.require_api_key().is_err());
    }
}
