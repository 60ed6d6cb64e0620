//! Observability infrastructure
//!
//! Prometheus metrics behind a process-global registry plus a structured
//! event logger for the notable moments in the pipeline (anomalies,
//! notifications, training, backoff).

use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_gauge, Gauge,
    Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for cycle and training latencies (seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    cycle_latency_seconds: Histogram,
    training_latency_seconds: Histogram,
    poll_interval_seconds: Gauge,
    devices_monitored: IntGauge,
    models_in_memory: IntGauge,
    anomalies_detected: IntCounter,
    notifications_sent: IntCounter,
    notifications_suppressed: IntCounter,
    cycle_errors: IntCounter,
    persistence_errors: IntCounter,
    models_trained: IntCounter,
    training_failures: IntCounter,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "netwatch_cycle_latency_seconds",
                "Time spent fetching and processing one poll cycle",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            training_latency_seconds: register_histogram!(
                "netwatch_training_latency_seconds",
                "Time spent fitting one device model",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register training_latency_seconds"),

            poll_interval_seconds: register_gauge!(
                "netwatch_poll_interval_seconds",
                "Current adaptive poll interval"
            )
            .expect("Failed to register poll_interval_seconds"),

            devices_monitored: register_int_gauge!(
                "netwatch_devices_monitored",
                "Devices seen in the most recent poll cycle"
            )
            .expect("Failed to register devices_monitored"),

            models_in_memory: register_int_gauge!(
                "netwatch_models_in_memory",
                "Device models currently loaded"
            )
            .expect("Failed to register models_in_memory"),

            anomalies_detected: register_int_counter!(
                "netwatch_anomalies_detected_total",
                "Anomalies detected across all devices"
            )
            .expect("Failed to register anomalies_detected_total"),

            notifications_sent: register_int_counter!(
                "netwatch_notifications_sent_total",
                "Notifications persisted after passing the cooldown gate"
            )
            .expect("Failed to register notifications_sent_total"),

            notifications_suppressed: register_int_counter!(
                "netwatch_notifications_suppressed_total",
                "Notifications suppressed by the cooldown gate"
            )
            .expect("Failed to register notifications_suppressed_total"),

            cycle_errors: register_int_counter!(
                "netwatch_cycle_errors_total",
                "Poll cycles that failed at the fetch stage"
            )
            .expect("Failed to register cycle_errors_total"),

            persistence_errors: register_int_counter!(
                "netwatch_persistence_errors_total",
                "Sample or notification writes that failed"
            )
            .expect("Failed to register persistence_errors_total"),

            models_trained: register_int_counter!(
                "netwatch_models_trained_total",
                "Successful model training runs"
            )
            .expect("Failed to register models_trained_total"),

            training_failures: register_int_counter!(
                "netwatch_training_failures_total",
                "Model training runs that failed"
            )
            .expect("Failed to register training_failures_total"),
        }
    }
}

/// Lightweight handle to the global metrics instance
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_cycle_latency(&self, seconds: f64) {
        self.inner().cycle_latency_seconds.observe(seconds);
    }

    pub fn observe_training_latency(&self, seconds: f64) {
        self.inner().training_latency_seconds.observe(seconds);
    }

    pub fn set_poll_interval(&self, seconds: f64) {
        self.inner().poll_interval_seconds.set(seconds);
    }

    pub fn set_devices_monitored(&self, count: i64) {
        self.inner().devices_monitored.set(count);
    }

    pub fn set_models_in_memory(&self, count: i64) {
        self.inner().models_in_memory.set(count);
    }

    pub fn inc_anomalies_detected(&self) {
        self.inner().anomalies_detected.inc();
    }

    pub fn inc_notifications_sent(&self) {
        self.inner().notifications_sent.inc();
    }

    pub fn inc_notifications_suppressed(&self) {
        self.inner().notifications_suppressed.inc();
    }

    pub fn inc_cycle_errors(&self) {
        self.inner().cycle_errors.inc();
    }

    pub fn inc_persistence_errors(&self) {
        self.inner().persistence_errors.inc();
    }

    pub fn inc_models_trained(&self) {
        self.inner().models_trained.inc();
    }

    pub fn inc_training_failures(&self) {
        self.inner().training_failures.inc();
    }
}

/// Structured logger for agent events
#[derive(Clone)]
pub struct StructuredLogger {
    agent_name: String,
}

impl StructuredLogger {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "agent_started",
            agent = %self.agent_name,
            version = %version,
            "Network monitor started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            agent = %self.agent_name,
            reason = %reason,
            "Network monitor shutting down"
        );
    }

    pub fn log_anomaly(
        &self,
        device_id: &str,
        hostname: &str,
        kind: &str,
        severity: &str,
        score: Option<f64>,
        details: &str,
    ) {
        match severity {
            "high" => {
                warn!(
                    event = "anomaly_detected",
                    agent = %self.agent_name,
                    device_id = %device_id,
                    hostname = %hostname,
                    anomaly_kind = %kind,
                    severity = %severity,
                    score = ?score,
                    details = %details,
                    "High-severity anomaly detected"
                );
            }
            _ => {
                info!(
                    event = "anomaly_detected",
                    agent = %self.agent_name,
                    device_id = %device_id,
                    hostname = %hostname,
                    anomaly_kind = %kind,
                    severity = %severity,
                    score = ?score,
                    details = %details,
                    "Anomaly detected"
                );
            }
        }
    }

    pub fn log_notification(&self, device_id: &str, kind: &str, severity: &str, suppressed: bool) {
        info!(
            event = "notification_decision",
            agent = %self.agent_name,
            device_id = %device_id,
            anomaly_kind = %kind,
            severity = %severity,
            suppressed = suppressed,
            "Notification gate decision"
        );
    }

    pub fn log_backoff(&self, old_interval_secs: f64, new_interval_secs: f64, errors: u32) {
        warn!(
            event = "poll_backoff",
            agent = %self.agent_name,
            old_interval_secs = old_interval_secs,
            new_interval_secs = new_interval_secs,
            consecutive_errors = errors,
            "Widening poll interval after sustained failure"
        );
    }

    pub fn log_health(&self, persistence_ok: bool, telemetry_ok: bool, models: usize) {
        info!(
            event = "health_check",
            agent = %self.agent_name,
            persistence_ok = persistence_ok,
            telemetry_ok = telemetry_ok,
            active_models = models,
            "Hourly health check"
        );
    }
}
