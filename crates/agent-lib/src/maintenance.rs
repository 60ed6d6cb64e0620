//! Scheduled maintenance jobs
//!
//! An explicit in-process list of (next_run, job) entries evaluated on a
//! one-second tick, independent of the monitor loop. Jobs are idempotent
//! and individually fault-isolated: a failing job logs, advances its next
//! run time, and leaves the other jobs and the main loop alone.

use crate::detector::{AnomalyKind, Severity};
use crate::health::{components, HealthRegistry};
use crate::models::SYSTEM_DEVICE_ID;
use crate::observability::StructuredLogger;
use crate::persist::PersistenceSink;
use crate::registry::ModelRegistry;
use crate::report;
use crate::source::TelemetrySource;
use anyhow::Result;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc, Weekday};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// When a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Hourly { minute: u32 },
    Daily { hour: u32, minute: u32 },
    Weekly { weekday: Weekday, hour: u32, minute: u32 },
}

impl Schedule {
    /// First run time strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Schedule::Hourly { minute } => {
                let candidate = at_time(now, now.hour(), minute);
                if candidate > now {
                    candidate
                } else {
                    candidate + ChronoDuration::hours(1)
                }
            }
            Schedule::Daily { hour, minute } => {
                let candidate = at_time(now, hour, minute);
                if candidate > now {
                    candidate
                } else {
                    candidate + ChronoDuration::days(1)
                }
            }
            Schedule::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let days_ahead = (weekday.num_days_from_monday() as i64
                    - now.weekday().num_days_from_monday() as i64)
                    .rem_euclid(7);
                let candidate = at_time(now, hour, minute) + ChronoDuration::days(days_ahead);
                if candidate > now {
                    candidate
                } else {
                    candidate + ChronoDuration::days(7)
                }
            }
        }
    }
}

/// Today's date at the given wall-clock time (UTC)
fn at_time(now: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(hour.min(23), minute.min(59), 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now)
}

/// The maintenance jobs the agent runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    RetrainModels,
    PurgeExpiredData,
    WeeklyReport,
    HealthCheck,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::RetrainModels => write!(f, "retrain_models"),
            JobKind::PurgeExpiredData => write!(f, "purge_expired_data"),
            JobKind::WeeklyReport => write!(f, "weekly_report"),
            JobKind::HealthCheck => write!(f, "health_check"),
        }
    }
}

#[derive(Debug)]
struct ScheduledJob {
    kind: JobKind,
    schedule: Schedule,
    next_run: DateTime<Utc>,
}

/// Maintenance configuration. Default times match the original deployment:
/// retraining daily at 03:00, purge Sunday 04:00, report Monday 07:00,
/// health checks on the hour.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Scheduler tick
    pub tick: Duration,
    pub retrain_schedule: Schedule,
    pub purge_schedule: Schedule,
    pub report_schedule: Schedule,
    pub health_schedule: Schedule,
    /// Samples older than this are purged weekly
    pub sample_retention: Duration,
    /// Notifications older than this are purged weekly
    pub notification_retention: Duration,
    pub report_dir: PathBuf,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            retrain_schedule: Schedule::Daily { hour: 3, minute: 0 },
            purge_schedule: Schedule::Weekly {
                weekday: Weekday::Sun,
                hour: 4,
                minute: 0,
            },
            report_schedule: Schedule::Weekly {
                weekday: Weekday::Mon,
                hour: 7,
                minute: 0,
            },
            health_schedule: Schedule::Hourly { minute: 0 },
            sample_retention: Duration::from_secs(90 * 24 * 3600),
            notification_retention: Duration::from_secs(180 * 24 * 3600),
            report_dir: PathBuf::from("reports"),
        }
    }
}

/// Runs the maintenance jobs on their schedules
pub struct MaintenanceScheduler {
    source: Arc<dyn TelemetrySource>,
    sink: Arc<dyn PersistenceSink>,
    registry: Arc<ModelRegistry>,
    health: HealthRegistry,
    logger: StructuredLogger,
    config: MaintenanceConfig,
    jobs: Vec<ScheduledJob>,
}

impl MaintenanceScheduler {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        sink: Arc<dyn PersistenceSink>,
        registry: Arc<ModelRegistry>,
        health: HealthRegistry,
        logger: StructuredLogger,
        config: MaintenanceConfig,
    ) -> Self {
        let now = Utc::now();
        let jobs = vec![
            ScheduledJob {
                kind: JobKind::RetrainModels,
                schedule: config.retrain_schedule,
                next_run: config.retrain_schedule.next_after(now),
            },
            ScheduledJob {
                kind: JobKind::PurgeExpiredData,
                schedule: config.purge_schedule,
                next_run: config.purge_schedule.next_after(now),
            },
            ScheduledJob {
                kind: JobKind::WeeklyReport,
                schedule: config.report_schedule,
                next_run: config.report_schedule.next_after(now),
            },
            ScheduledJob {
                kind: JobKind::HealthCheck,
                schedule: config.health_schedule,
                next_run: config.health_schedule.next_after(now),
            },
        ];

        Self {
            source,
            sink,
            registry,
            health,
            logger,
            config,
            jobs,
        }
    }

    pub async fn run(mut self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(jobs = self.jobs.len(), "starting maintenance scheduler");
        let mut ticker = tokio::time::interval(self.config.tick);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_due_jobs(Utc::now()).await;
                }
                _ = shutdown.recv() => {
                    info!("shutting down maintenance scheduler");
                    break;
                }
            }
        }
    }

    /// Run every job whose time has come; each advances its schedule
    /// whether it succeeded or not.
    async fn run_due_jobs(&mut self, now: DateTime<Utc>) {
        for idx in 0..self.jobs.len() {
            if self.jobs[idx].next_run > now {
                continue;
            }

            let kind = self.jobs[idx].kind;
            if let Err(error) = self.run_job(kind).await {
                warn!(job = %kind, error = %error, "maintenance job failed");
            }
            self.jobs[idx].next_run = self.jobs[idx].schedule.next_after(now);
        }
    }

    async fn run_job(&self, kind: JobKind) -> Result<()> {
        match kind {
            JobKind::RetrainModels => self.retrain_models().await,
            JobKind::PurgeExpiredData => self.purge_expired().await,
            JobKind::WeeklyReport => self.weekly_report().await,
            JobKind::HealthCheck => self.health_check().await,
        }
    }

    /// Queue a retrain for every active device. Each device is an
    /// independent unit of work on the registry's training pool.
    async fn retrain_models(&self) -> Result<()> {
        let devices = self.sink.list_active_device_ids().await?;
        if devices.is_empty() {
            info!("no active devices to retrain");
            return Ok(());
        }

        for device_id in &devices {
            self.registry.request_retrain(device_id);
        }
        info!(devices = devices.len(), "scheduled model retraining");
        Ok(())
    }

    async fn purge_expired(&self) -> Result<()> {
        let now = Utc::now().timestamp();
        let sample_cutoff = now - self.config.sample_retention.as_secs() as i64;
        let notification_cutoff = now - self.config.notification_retention.as_secs() as i64;

        let samples = self.sink.purge_samples_before(sample_cutoff).await?;
        let notifications = self
            .sink
            .purge_notifications_before(notification_cutoff)
            .await?;

        info!(samples, notifications, "purged expired records");
        Ok(())
    }

    async fn weekly_report(&self) -> Result<()> {
        let path = report::generate(self.sink.as_ref(), &self.config.report_dir, Utc::now()).await?;
        info!(path = %path.display(), "weekly report written");
        Ok(())
    }

    /// Probe the persistence sink and the telemetry source. A failure on
    /// either side emits a high-severity system alert, bypassing the
    /// per-device cooldown gate (this is a system-level condition).
    async fn health_check(&self) -> Result<()> {
        let persistence = self.sink.ping().await;
        let telemetry = self.source.fetch().await;

        match &persistence {
            Ok(()) => self.health.set_healthy(components::PERSISTENCE).await,
            Err(error) => {
                self.health
                    .set_unhealthy(components::PERSISTENCE, error.to_string())
                    .await
            }
        }
        match &telemetry {
            Ok(_) => self.health.set_healthy(components::TELEMETRY).await,
            Err(error) => {
                self.health
                    .set_unhealthy(components::TELEMETRY, error.to_string())
                    .await
            }
        }

        let persistence_ok = persistence.is_ok();
        let telemetry_ok = telemetry.is_ok();
        self.logger
            .log_health(persistence_ok, telemetry_ok, self.registry.model_count());

        if persistence_ok && telemetry_ok {
            return Ok(());
        }

        let mut issues = Vec::new();
        if !persistence_ok {
            issues.push("persistence sink unreachable");
        }
        if !telemetry_ok {
            issues.push("telemetry source unreachable");
        }
        let message = format!("System health check failed: {}", issues.join(", "));

        if let Err(error) = self
            .sink
            .insert_notification(
                SYSTEM_DEVICE_ID,
                AnomalyKind::SystemAlert,
                Severity::High,
                &message,
            )
            .await
        {
            warn!(error = %error, "failed to persist system alert");
        }

        Ok(())
    }
}
