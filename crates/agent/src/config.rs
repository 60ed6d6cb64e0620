//! Agent configuration
//!
//! Read from `NETWATCH_`-prefixed environment variables with defaults for
//! every option; the accessors below expand the flat settings into the
//! per-component config structs the library expects.

use anyhow::Result;
use chrono::Weekday;
use netwatch_lib::detector::DetectorConfig;
use netwatch_lib::features::FeatureConfig;
use netwatch_lib::maintenance::{MaintenanceConfig, Schedule};
use netwatch_lib::monitor::LoopConfig;
use netwatch_lib::registry::TrainingConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Agent name attached to structured log events
    #[serde(default = "default_agent_name")]
    pub agent_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Telemetry endpoint returning per-device readings
    #[serde(default = "default_telemetry_endpoint")]
    pub telemetry_endpoint: String,

    /// Telemetry request timeout in seconds
    #[serde(default = "default_telemetry_timeout")]
    pub telemetry_timeout_secs: u64,

    /// Path of the sqlite database
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Directory for persisted model bundles
    #[serde(default = "default_model_dir")]
    pub model_dir: String,

    /// Directory for weekly reports
    #[serde(default = "default_report_dir")]
    pub report_dir: String,

    /// Base poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: f64,

    /// Poll interval floor in seconds
    #[serde(default = "default_min_poll_interval")]
    pub min_poll_interval_secs: f64,

    /// Poll interval hard cap in seconds
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_secs: f64,

    /// Widening step when a cycle overruns, in seconds
    #[serde(default = "default_poll_interval_step")]
    pub poll_interval_step_secs: f64,

    /// Interval multiplier after sustained failure
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Failed cycles in a row before backing off
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    /// Feature vectors retained per device
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Minimum samples before a model is trained
    #[serde(default = "default_min_training_samples")]
    pub min_training_samples: usize,

    /// Model age before retraining, in seconds
    #[serde(default = "default_retrain_interval")]
    pub retrain_interval_secs: u64,

    /// Expected fraction of outliers in training data
    #[serde(default = "default_contamination")]
    pub contamination: f64,

    /// Model score below which a sample is anomalous
    #[serde(default = "default_score_threshold")]
    pub anomaly_score_threshold: f64,

    /// Score below which an anomaly is high severity
    #[serde(default = "default_high_severity_score")]
    pub high_severity_score: f64,

    /// Score below which an anomaly is medium severity
    #[serde(default = "default_medium_severity_score")]
    pub medium_severity_score: f64,

    /// Cooldown between notifications of the same kind, in seconds
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Sample retention in days
    #[serde(default = "default_sample_retention_days")]
    pub sample_retention_days: u64,

    /// Notification retention in days
    #[serde(default = "default_notification_retention_days")]
    pub notification_retention_days: u64,

    /// Hour of the daily retraining sweep
    #[serde(default = "default_retrain_hour")]
    pub retrain_hour: u32,

    /// Weekday and hour of the weekly purge
    #[serde(default = "default_purge_weekday")]
    pub purge_weekday: String,
    #[serde(default = "default_purge_hour")]
    pub purge_hour: u32,

    /// Weekday and hour of the weekly report
    #[serde(default = "default_report_weekday")]
    pub report_weekday: String,
    #[serde(default = "default_report_hour")]
    pub report_hour: u32,

    /// Minute of the hourly health check
    #[serde(default = "default_health_minute")]
    pub health_minute: u32,
}

fn default_agent_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "netwatch".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_telemetry_endpoint() -> String {
    "http://127.0.0.1:8000/connected-devices".to_string()
}

fn default_telemetry_timeout() -> u64 {
    3
}

fn default_database_path() -> String {
    "netwatch.db".to_string()
}

fn default_model_dir() -> String {
    "models".to_string()
}

fn default_report_dir() -> String {
    "reports".to_string()
}

fn default_poll_interval() -> f64 {
    2.0
}

fn default_min_poll_interval() -> f64 {
    1.0
}

fn default_max_poll_interval() -> f64 {
    10.0
}

fn default_poll_interval_step() -> f64 {
    0.5
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_max_consecutive_errors() -> u32 {
    3
}

fn default_history_capacity() -> usize {
    100
}

fn default_min_training_samples() -> usize {
    100
}

fn default_retrain_interval() -> u64 {
    24 * 3600
}

fn default_contamination() -> f64 {
    0.05
}

fn default_score_threshold() -> f64 {
    -0.5
}

fn default_high_severity_score() -> f64 {
    -0.8
}

fn default_medium_severity_score() -> f64 {
    -0.65
}

fn default_cooldown() -> u64 {
    300
}

fn default_sample_retention_days() -> u64 {
    90
}

fn default_notification_retention_days() -> u64 {
    180
}

fn default_retrain_hour() -> u32 {
    3
}

fn default_purge_weekday() -> String {
    "sun".to_string()
}

fn default_purge_hour() -> u32 {
    4
}

fn default_report_weekday() -> String {
    "mon".to_string()
}

fn default_report_hour() -> u32 {
    7
}

fn default_health_minute() -> u32 {
    0
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_name: default_agent_name(),
            api_port: default_api_port(),
            telemetry_endpoint: default_telemetry_endpoint(),
            telemetry_timeout_secs: default_telemetry_timeout(),
            database_path: default_database_path(),
            model_dir: default_model_dir(),
            report_dir: default_report_dir(),
            poll_interval_secs: default_poll_interval(),
            min_poll_interval_secs: default_min_poll_interval(),
            max_poll_interval_secs: default_max_poll_interval(),
            poll_interval_step_secs: default_poll_interval_step(),
            backoff_factor: default_backoff_factor(),
            max_consecutive_errors: default_max_consecutive_errors(),
            history_capacity: default_history_capacity(),
            min_training_samples: default_min_training_samples(),
            retrain_interval_secs: default_retrain_interval(),
            contamination: default_contamination(),
            anomaly_score_threshold: default_score_threshold(),
            high_severity_score: default_high_severity_score(),
            medium_severity_score: default_medium_severity_score(),
            cooldown_secs: default_cooldown(),
            sample_retention_days: default_sample_retention_days(),
            notification_retention_days: default_notification_retention_days(),
            retrain_hour: default_retrain_hour(),
            purge_weekday: default_purge_weekday(),
            purge_hour: default_purge_hour(),
            report_weekday: default_report_weekday(),
            report_hour: default_report_hour(),
            health_minute: default_health_minute(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("NETWATCH"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }

    pub fn telemetry_timeout(&self) -> Duration {
        Duration::from_secs(self.telemetry_timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            poll_interval: secs_f64(self.poll_interval_secs),
            min_poll_interval: secs_f64(self.min_poll_interval_secs),
            max_poll_interval: secs_f64(self.max_poll_interval_secs),
            overrun_step: secs_f64(self.poll_interval_step_secs),
            backoff_factor: self.backoff_factor,
            max_consecutive_errors: self.max_consecutive_errors,
            error_pause: Duration::from_secs(1),
        }
    }

    pub fn feature_config(&self) -> FeatureConfig {
        FeatureConfig {
            history_capacity: self.history_capacity,
        }
    }

    pub fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            min_samples: self.min_training_samples,
            retrain_interval: Duration::from_secs(self.retrain_interval_secs),
            contamination: self.contamination,
            ..TrainingConfig::default()
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            score_threshold: self.anomaly_score_threshold,
            high_severity_score: self.high_severity_score,
            medium_severity_score: self.medium_severity_score,
            ..DetectorConfig::default()
        }
    }

    pub fn maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            retrain_schedule: Schedule::Daily {
                hour: self.retrain_hour,
                minute: 0,
            },
            purge_schedule: Schedule::Weekly {
                weekday: parse_weekday(&self.purge_weekday, Weekday::Sun),
                hour: self.purge_hour,
                minute: 0,
            },
            report_schedule: Schedule::Weekly {
                weekday: parse_weekday(&self.report_weekday, Weekday::Mon),
                hour: self.report_hour,
                minute: 0,
            },
            health_schedule: Schedule::Hourly {
                minute: self.health_minute,
            },
            sample_retention: Duration::from_secs(self.sample_retention_days * 24 * 3600),
            notification_retention: Duration::from_secs(
                self.notification_retention_days * 24 * 3600,
            ),
            report_dir: PathBuf::from(&self.report_dir),
            ..MaintenanceConfig::default()
        }
    }
}

fn secs_f64(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::from_secs(1)
    }
}

fn parse_weekday(name: &str, fallback: Weekday) -> Weekday {
    Weekday::from_str(name).unwrap_or(fallback)
}
