use parley_core::{audio::AudioFormat, delivery::DeliveryConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Which scorer grades finished conversations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScorerKind {
    OpenAI,
    Mock,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub openai_api_key: String,
    pub realtime_url: String,
    pub realtime_model: String,
    pub voice: String,
    pub scoring_model: String,
    pub scorer: ScorerKind,
    pub log_level: Level,
    pub prompts_path: PathBuf,
    pub reports_path: PathBuf,
    pub delivery: DeliveryConfig,
    pub shutdown_timeout: Duration,
    pub session_idle_timeout: Duration,
    pub reaper_interval: Duration,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Reads a non-negative number of seconds, fractional values allowed.
fn secs_var(name: &str, default: f64) -> Result<Duration, ConfigError> {
    let secs = parse_var::<f64>(name, default)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str = var_or("BIND_ADDRESS", "0.0.0.0:7860");
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let realtime_url = var_or("REALTIME_URL", "wss://api.openai.com/v1/realtime");
        let realtime_model = var_or("REALTIME_MODEL", "gpt-4o-realtime-preview-2024-12-17");
        let voice = var_or("VOICE", "alloy");
        let scoring_model = var_or("SCORING_MODEL", "gpt-4o-mini");

        let scorer_str = var_or("SCORER", "openai");
        let scorer = match scorer_str.to_lowercase().as_str() {
            "openai" => ScorerKind::OpenAI,
            "mock" => ScorerKind::Mock,
            other => {
                return Err(ConfigError::InvalidValue(
                    "SCORER".to_string(),
                    format!("'{}' is not one of 'openai', 'mock'", other),
                ));
            }
        };

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = PathBuf::from(var_or("PROMPTS_PATH", "./prompts"));
        let reports_path = PathBuf::from(var_or("REPORTS_PATH", "./reports"));

        let delivery = DeliveryConfig {
            keepalive_interval: secs_var("KEEPALIVE_INTERVAL_SECS", 3.0)?,
            drain_floor: secs_var("DRAIN_FLOOR_SECS", 0.0)?,
            drain_safety_margin: secs_var("DRAIN_SAFETY_MARGIN_SECS", 3.0)?,
            ack_audio_timeout: secs_var("ACK_AUDIO_TIMEOUT_SECS", 10.0)?,
            summary_audio_timeout: secs_var("SUMMARY_AUDIO_TIMEOUT_SECS", 20.0)?,
            goodbye_audio_timeout: secs_var("GOODBYE_AUDIO_TIMEOUT_SECS", 10.0)?,
            turn_request_timeout: secs_var("TURN_REQUEST_TIMEOUT_SECS", 10.0)?,
            audio_format: AudioFormat::PCM16_24K_MONO,
        };
        if delivery.keepalive_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "KEEPALIVE_INTERVAL_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let reaper_interval = secs_var("REAPER_INTERVAL_SECS", 300.0)?;
        if reaper_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "REAPER_INTERVAL_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            bind_address,
            openai_api_key,
            realtime_url,
            realtime_model,
            voice,
            scoring_model,
            scorer,
            log_level,
            prompts_path,
            reports_path,
            delivery,
            shutdown_timeout: secs_var("SHUTDOWN_TIMEOUT_SECS", 3.0)?,
            session_idle_timeout: secs_var("SESSION_IDLE_TIMEOUT_SECS", 1800.0)?,
            reaper_interval,
        })
    }
}
