//! Main monitoring loop
//!
//! One cycle pulls telemetry for every tracked device, builds features,
//! scores them against the device's model (or the threshold fallback),
//! gates notifications through the cooldown table, and persists the sample
//! and any fired notification. Between cycles the loop sleeps for whatever
//! remains of the poll interval; the interval itself adapts to overload and
//! sustained failure.
//!
//! Per-device state (history, previous rates, cooldowns) is owned by this
//! loop exclusively. The model registry is the only shared structure.

use crate::detector::{AnomalyDetector, DetectorConfig};
use crate::error::FetchError;
use crate::features::{FeatureBuilder, FeatureConfig};
use crate::gate::NotificationGate;
use crate::health::{components, HealthRegistry};
use crate::models::DeviceReading;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::persist::PersistenceSink;
use crate::registry::ModelRegistry;
use crate::source::TelemetrySource;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Elapsed-over-interval ratio that triggers the overrun widening
const OVERRUN_FACTOR: f64 = 1.5;

/// Configuration for the monitor loop and its interval policy
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Base poll interval (default: 2 seconds)
    pub poll_interval: Duration,
    /// Floor the interval never drops below
    pub min_poll_interval: Duration,
    /// Hard cap the interval never exceeds (default: 10 seconds)
    pub max_poll_interval: Duration,
    /// Fixed widening step when a cycle overruns the interval
    pub overrun_step: Duration,
    /// Interval multiplier after sustained failure
    pub backoff_factor: f64,
    /// Failed cycles in a row before the backoff multiplier applies
    pub max_consecutive_errors: u32,
    /// Short pause after a failed cycle
    pub error_pause: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            min_poll_interval: Duration::from_secs(1),
            max_poll_interval: Duration::from_secs(10),
            overrun_step: Duration::from_millis(500),
            backoff_factor: 1.5,
            max_consecutive_errors: 3,
            error_pause: Duration::from_secs(1),
        }
    }
}

/// Adaptive poll-interval policy.
///
/// Widens by a fixed step when cycles overrun, multiplies by the backoff
/// factor after `max_consecutive_errors` failed cycles in a row, and stays
/// inside the configured floor and cap. One successful cycle resets the
/// error counter.
#[derive(Debug)]
pub struct IntervalPolicy {
    current: Duration,
    floor: Duration,
    cap: Duration,
    step: Duration,
    backoff_factor: f64,
    max_consecutive_errors: u32,
    error_pause: Duration,
    consecutive_errors: u32,
}

impl IntervalPolicy {
    pub fn new(config: &LoopConfig) -> Self {
        let floor = config.min_poll_interval.min(config.max_poll_interval);
        let cap = config.max_poll_interval.max(config.min_poll_interval);
        Self {
            current: config.poll_interval.clamp(floor, cap),
            floor,
            cap,
            step: config.overrun_step,
            backoff_factor: config.backoff_factor,
            max_consecutive_errors: config.max_consecutive_errors.max(1),
            error_pause: config.error_pause,
            consecutive_errors: 0,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Record a successful cycle; returns the sleep until the next one
    pub fn on_success(&mut self, elapsed: Duration) -> Duration {
        self.consecutive_errors = 0;
        let sleep = self.current.saturating_sub(elapsed);
        if elapsed.as_secs_f64() > self.current.as_secs_f64() * OVERRUN_FACTOR {
            self.current = (self.current + self.step).clamp(self.floor, self.cap);
        }
        sleep
    }

    /// Record a failed cycle; returns the short pause before retrying
    pub fn on_failure(&mut self) -> Duration {
        self.consecutive_errors += 1;
        if self.consecutive_errors >= self.max_consecutive_errors {
            let widened = Duration::from_secs_f64(self.current.as_secs_f64() * self.backoff_factor);
            self.current = widened.clamp(self.floor, self.cap);
            self.consecutive_errors = 0;
        }
        self.error_pause
    }
}

/// Counters from one poll cycle
#[derive(Debug, Default, Clone)]
pub struct CycleStats {
    pub devices: usize,
    pub anomalies: usize,
    pub notifications: usize,
    pub suppressed: usize,
    pub persisted: usize,
}

/// The monitoring orchestrator
pub struct MonitorLoop {
    source: Arc<dyn TelemetrySource>,
    sink: Arc<dyn PersistenceSink>,
    registry: Arc<ModelRegistry>,
    detector: AnomalyDetector,
    features: FeatureBuilder,
    gate: NotificationGate,
    policy: IntervalPolicy,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl MonitorLoop {
    /// Run until shutdown
    pub async fn run(mut self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            interval_secs = self.policy.current().as_secs_f64(),
            "starting monitor loop"
        );

        loop {
            let sleep_for = self.tick().await;
            self.metrics
                .set_poll_interval(self.policy.current().as_secs_f64());

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.recv() => {
                    info!("shutting down monitor loop");
                    break;
                }
            }
        }
    }

    /// Run one cycle and apply the interval policy; returns how long to
    /// sleep before the next cycle.
    pub async fn tick(&mut self) -> Duration {
        let start = Instant::now();
        match self.run_cycle().await {
            Ok(stats) => {
                let elapsed = start.elapsed();
                self.metrics.observe_cycle_latency(elapsed.as_secs_f64());
                self.metrics.set_devices_monitored(stats.devices as i64);
                self.metrics
                    .set_models_in_memory(self.registry.model_count() as i64);
                self.health.set_healthy(components::TELEMETRY).await;
                debug!(
                    devices = stats.devices,
                    anomalies = stats.anomalies,
                    notifications = stats.notifications,
                    suppressed = stats.suppressed,
                    elapsed_ms = elapsed.as_millis(),
                    "poll cycle complete"
                );
                self.policy.on_success(elapsed)
            }
            Err(error) => {
                self.metrics.inc_cycle_errors();
                self.health
                    .set_degraded(components::TELEMETRY, error.to_string())
                    .await;
                let errors = self.policy.consecutive_errors() + 1;
                let old = self.policy.current();
                let pause = self.policy.on_failure();
                let new = self.policy.current();
                if new != old {
                    self.logger
                        .log_backoff(old.as_secs_f64(), new.as_secs_f64(), errors);
                }
                warn!(error = %error, consecutive_errors = errors, "poll cycle failed");
                pause
            }
        }
    }

    /// Fetch and process every device once. Only the fetch itself can fail
    /// the cycle; per-device processing has partial-failure semantics.
    async fn run_cycle(&mut self) -> Result<CycleStats, FetchError> {
        let readings = self.source.fetch().await?;
        let mut stats = CycleStats {
            devices: readings.len(),
            ..CycleStats::default()
        };

        let now = Utc::now();
        for reading in &readings {
            self.process_reading(reading, now, &mut stats).await;
        }

        Ok(stats)
    }

    async fn process_reading(
        &mut self,
        reading: &DeviceReading,
        now: chrono::DateTime<Utc>,
        stats: &mut CycleStats,
    ) {
        let device_id = reading.device_id.as_str();
        let features = self.features.build(reading, now);

        let model = self.registry.get_or_create(device_id).await;
        if model.is_some() {
            self.registry
                .retrain_if_due(device_id, || self.features.history_snapshot(device_id));
        } else if self.features.history_len(device_id) >= self.registry.min_samples() {
            self.registry
                .request_training(device_id, self.features.history_snapshot(device_id));
        }

        if let Some(info) = self.detector.detect(device_id, model.as_deref(), &features) {
            stats.anomalies += 1;
            self.metrics.inc_anomalies_detected();
            self.logger.log_anomaly(
                device_id,
                reading.hostname.as_deref().unwrap_or("Unknown"),
                &info.kind.to_string(),
                &info.severity.to_string(),
                info.score,
                &info.message,
            );

            if self.gate.should_fire(device_id, info.kind) {
                let message = format!("{} for {}", info.message, reading.display_name());
                match self
                    .sink
                    .insert_notification(device_id, info.kind, info.severity, &message)
                    .await
                {
                    Ok(()) => {
                        stats.notifications += 1;
                        self.metrics.inc_notifications_sent();
                        self.logger.log_notification(
                            device_id,
                            &info.kind.to_string(),
                            &info.severity.to_string(),
                            false,
                        );
                    }
                    Err(error) => {
                        self.metrics.inc_persistence_errors();
                        warn!(
                            device_id = %device_id,
                            error = %error,
                            "failed to persist notification"
                        );
                    }
                }
            } else {
                stats.suppressed += 1;
                self.metrics.inc_notifications_suppressed();
            }
        }

        match self
            .sink
            .insert_sample(device_id, features.upload, features.download)
            .await
        {
            Ok(()) => stats.persisted += 1,
            Err(error) => {
                self.metrics.inc_persistence_errors();
                warn!(
                    device_id = %device_id,
                    error = %error,
                    "failed to persist sample"
                );
            }
        }
    }
}

/// Builder for the monitor loop
pub struct MonitorLoopBuilder {
    source: Option<Arc<dyn TelemetrySource>>,
    sink: Option<Arc<dyn PersistenceSink>>,
    registry: Option<Arc<ModelRegistry>>,
    loop_config: LoopConfig,
    detector_config: DetectorConfig,
    feature_config: FeatureConfig,
    cooldown: Duration,
    health: Option<HealthRegistry>,
    logger: Option<StructuredLogger>,
}

impl MonitorLoopBuilder {
    pub fn new() -> Self {
        Self {
            source: None,
            sink: None,
            registry: None,
            loop_config: LoopConfig::default(),
            detector_config: DetectorConfig::default(),
            feature_config: FeatureConfig::default(),
            cooldown: Duration::from_secs(300),
            health: None,
            logger: None,
        }
    }

    pub fn source(mut self, source: Arc<dyn TelemetrySource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn loop_config(mut self, config: LoopConfig) -> Self {
        self.loop_config = config;
        self
    }

    pub fn detector_config(mut self, config: DetectorConfig) -> Self {
        self.detector_config = config;
        self
    }

    pub fn feature_config(mut self, config: FeatureConfig) -> Self {
        self.feature_config = config;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<MonitorLoop> {
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Telemetry source is required"))?;
        let sink = self
            .sink
            .ok_or_else(|| anyhow::anyhow!("Persistence sink is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("Model registry is required"))?;

        Ok(MonitorLoop {
            source,
            sink,
            registry,
            detector: AnomalyDetector::new(self.detector_config),
            features: FeatureBuilder::new(self.feature_config),
            gate: NotificationGate::new().with_cooldown(self.cooldown),
            policy: IntervalPolicy::new(&self.loop_config),
            health: self.health.unwrap_or_default(),
            metrics: AgentMetrics::new(),
            logger: self
                .logger
                .unwrap_or_else(|| StructuredLogger::new("netwatch")),
        })
    }
}

impl Default for MonitorLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
