//! Service configuration read from the environment
//!
//! Each `from_env` reads `std::env`; `from_lookup` takes any key lookup so
//! the parsing rules can be tested without touching process state.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::fetch::metrics::KAMINO_API_URL;
use crate::fetch::polymarket::POLYMARKET_API_URL;
use crate::fetch::pyth::PYTH_API_URL;
use crate::notify::email::RESEND_API_URL;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match non_empty(lookup, key) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn required<F>(lookup: &F, key: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup, key).ok_or(ConfigError::Missing(key))
}

/// Evaluator service settings
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    pub rules_file: PathBuf,
    pub check_interval: Duration,
    /// `None` disables hot reload
    pub reload_interval: Option<Duration>,
    pub pyth_api_url: String,
    pub pyth_api_key: Option<String>,
    pub polymarket_api_url: String,
    pub kamino_api_url: String,
    pub http_timeout: Duration,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            rules_file: PathBuf::from("alert-rules.json"),
            check_interval: Duration::from_secs(60),
            reload_interval: None,
            pyth_api_url: PYTH_API_URL.to_string(),
            pyth_api_key: None,
            polymarket_api_url: POLYMARKET_API_URL.to_string(),
            kamino_api_url: KAMINO_API_URL.to_string(),
            http_timeout: Duration::from_secs(10),
        }
    }
}

impl EvaluatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let check_secs: u64 = parse_or(&lookup, "TRIPWIRE_CHECK_INTERVAL_SECS", 60)?;
        if check_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "TRIPWIRE_CHECK_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }
        let reload_secs: u64 = parse_or(&lookup, "TRIPWIRE_RULE_RELOAD_SECS", 0)?;

        Ok(Self {
            rules_file: non_empty(&lookup, "TRIPWIRE_RULES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.rules_file),
            check_interval: Duration::from_secs(check_secs),
            reload_interval: (reload_secs > 0).then(|| Duration::from_secs(reload_secs)),
            pyth_api_url: non_empty(&lookup, "PYTH_API_URL").unwrap_or(defaults.pyth_api_url),
            pyth_api_key: non_empty(&lookup, "PYTH_API_KEY"),
            polymarket_api_url: non_empty(&lookup, "POLYMARKET_API_URL")
                .unwrap_or(defaults.polymarket_api_url),
            kamino_api_url: non_empty(&lookup, "KAMINO_API_URL").unwrap_or(defaults.kamino_api_url),
            http_timeout: defaults.http_timeout,
        })
    }
}

/// Delivery service settings
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub resend_api_key: String,
    pub resend_from_email: String,
    pub resend_api_url: String,
    /// Chat delivery is disabled without a token
    pub telegram_bot_token: Option<String>,
    pub shutdown_grace: Duration,
}

impl NotifierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let grace_ms: u64 = parse_or(&lookup, "TRIPWIRE_SHUTDOWN_GRACE_MS", 1000)?;

        Ok(Self {
            resend_api_key: required(&lookup, "RESEND_API_KEY")?,
            resend_from_email: required(&lookup, "RESEND_FROM_EMAIL")?,
            resend_api_url: non_empty(&lookup, "RESEND_API_URL")
                .unwrap_or_else(|| RESEND_API_URL.to_string()),
            telegram_bot_token: non_empty(&lookup, "TELEGRAM_BOT_TOKEN"),
            shutdown_grace: Duration::from_millis(grace_ms),
        })
    }
}

/// Broker connection settings shared by both services
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    /// Consumer groups are `{group_prefix}-token`, `-defi`, `-predict`
    pub group_prefix: String,
    pub auto_offset_reset: String,
    pub session_timeout_ms: u32,
    pub fetch_timeout: Duration,
    pub probe_timeout: Duration,
    pub admin_timeout: Duration,
    pub publish_timeout: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_prefix: "notification-service".to_string(),
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 30000,
            fetch_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            admin_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

impl KafkaConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let auto_offset_reset = non_empty(&lookup, "KAFKA_AUTO_OFFSET_RESET")
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or(defaults.auto_offset_reset);
        if !matches!(auto_offset_reset.as_str(), "earliest" | "latest") {
            return Err(ConfigError::Invalid {
                key: "KAFKA_AUTO_OFFSET_RESET",
                value: auto_offset_reset,
            });
        }

        Ok(Self {
            brokers: non_empty(&lookup, "KAFKA_BROKERS").unwrap_or(defaults.brokers),
            group_prefix: non_empty(&lookup, "KAFKA_GROUP_PREFIX").unwrap_or(defaults.group_prefix),
            auto_offset_reset,
            ..defaults
        })
    }
}
