use anyhow::{Context, Result};
use chrono::NaiveTime;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub system: SystemConfig,
    pub source: SourceConfig,
    pub sampling: SamplingConfig,
    pub thresholds: ThresholdsConfig,
    pub trading_hours: TradingHoursConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    pub database_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// JSON export of the live sheet, one `instrument -> value` map.
    pub path: String,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    pub poll_interval_ms: u64,
    pub stability_duration_ms: u64,
    #[serde(default)]
    pub startup_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdsConfig {
    pub min_price_change: f64,
    /// Candidate-reset threshold. Falls back to `min_price_change`.
    #[serde(default)]
    pub distinctness_epsilon: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingHoursConfig {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_restore_baseline")]
    pub restore_baseline: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            restore_baseline: default_restore_baseline(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub csv_logging: bool,
    #[serde(default = "default_csv_log_path")]
    pub csv_log_path: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            csv_logging: false,
            csv_log_path: default_csv_log_path(),
        }
    }
}

fn default_read_timeout_ms() -> u64 { 2_000 }
fn default_queue_capacity() -> usize { 256 }
fn default_restore_baseline() -> bool { true }
fn default_csv_log_path() -> String { "snapshots.csv".to_string() }

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub config_path: String,
    pub database_path: Option<String>,
    pub log_json: bool,
    /// Directory for rotated log files. `None` when set to an empty string.
    pub log_dir: Option<String>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {}", path))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }
}

impl EnvConfig {
    pub fn load() -> Self {
        dotenv::dotenv().ok();

        Self {
            config_path: std::env::var("SPREAD_RECORDER_CONFIG")
                .unwrap_or_else(|_| "config.toml".to_string()),
            database_path: std::env::var("SPREAD_RECORDER_DB").ok(),
            log_json: std::env::var("SPREAD_RECORDER_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            log_dir: match std::env::var("SPREAD_RECORDER_LOG_DIR") {
                Ok(dir) if dir.trim().is_empty() => None,
                Ok(dir) => Some(dir),
                Err(_) => Some("logs".to_string()),
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("{name} must be a finite, non-negative number (got {value})")]
    InvalidThreshold { name: &'static str, value: f64 },

    #[error("invalid time of day for {name}: {value:?} (expected HH:MM)")]
    InvalidTime { name: &'static str, value: String },

    #[error("trading start {start} must be before trading end {end}")]
    EmptyTradingWindow { start: NaiveTime, end: NaiveTime },

    #[error("writer queue capacity must be greater than zero")]
    ZeroQueueCapacity,
}

/// Validated, immutable settings handed to the sampling scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingSettings {
    pub poll_interval: Duration,
    pub read_timeout: Duration,
    pub startup_delay: Duration,
    pub stability_duration: Duration,
    pub min_price_change: Decimal,
    pub distinctness_epsilon: Decimal,
    pub trading_start: NaiveTime,
    pub trading_end: NaiveTime,
    pub queue_capacity: usize,
}

impl SamplingSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let poll_interval = non_zero_ms("poll_interval_ms", config.sampling.poll_interval_ms)?;
        let stability_duration =
            non_zero_ms("stability_duration_ms", config.sampling.stability_duration_ms)?;
        let read_timeout = non_zero_ms("read_timeout_ms", config.source.read_timeout_ms)?;

        let min_price_change =
            threshold("min_price_change", config.thresholds.min_price_change)?;
        let distinctness_epsilon = match config.thresholds.distinctness_epsilon {
            Some(eps) => threshold("distinctness_epsilon", eps)?,
            None => min_price_change,
        };

        let trading_start = parse_time("trading_hours.start", &config.trading_hours.start)?;
        let trading_end = parse_time("trading_hours.end", &config.trading_hours.end)?;
        if trading_start >= trading_end {
            return Err(ConfigError::EmptyTradingWindow {
                start: trading_start,
                end: trading_end,
            });
        }

        if config.persistence.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }

        Ok(Self {
            poll_interval,
            read_timeout,
            startup_delay: Duration::from_secs(config.sampling.startup_delay_secs),
            stability_duration,
            min_price_change,
            distinctness_epsilon,
            trading_start,
            trading_end,
            queue_capacity: config.persistence.queue_capacity,
        })
    }
}

fn non_zero_ms(name: &'static str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::ZeroDuration(name));
    }
    Ok(Duration::from_millis(ms))
}

fn threshold(name: &'static str, value: f64) -> Result<Decimal, ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::InvalidThreshold { name, value });
    }
    Decimal::from_f64(value).ok_or(ConfigError::InvalidThreshold { name, value })
}

/// Parse a "HH:MM" time-of-day string.
pub fn parse_time(name: &'static str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| ConfigError::InvalidTime {
        name,
        value: value.to_string(),
    })
}
