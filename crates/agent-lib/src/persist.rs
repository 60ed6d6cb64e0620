//! Persistence sink seam and the embedded sqlite implementation
//!
//! The sink stores bandwidth samples and notifications, serves history for
//! model training, and answers the summary queries behind the weekly
//! report. Each write commits independently; a failure for one record never
//! affects the rest of the cycle.

use crate::detector::{AnomalyKind, Severity};
use crate::error::PersistenceError;
use crate::models::{AnomalySummary, BandwidthSummary, StoredSample};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Window that defines an "active" device (samples within the last day)
const ACTIVE_WINDOW_SECS: i64 = 24 * 3600;

/// Durable store for samples and notifications
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn insert_sample(
        &self,
        device_id: &str,
        upload: f64,
        download: f64,
    ) -> Result<(), PersistenceError>;

    async fn insert_notification(
        &self,
        device_id: &str,
        kind: AnomalyKind,
        severity: Severity,
        message: &str,
    ) -> Result<(), PersistenceError>;

    /// Most recent samples first; callers reverse for chronological replay
    async fn fetch_history(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredSample>, PersistenceError>;

    /// Devices with at least one sample in the last 24 hours
    async fn list_active_device_ids(&self) -> Result<Vec<String>, PersistenceError>;

    /// Delete samples recorded before the cutoff; returns rows removed
    async fn purge_samples_before(&self, cutoff: i64) -> Result<usize, PersistenceError>;

    /// Delete notifications created before the cutoff; returns rows removed
    async fn purge_notifications_before(&self, cutoff: i64) -> Result<usize, PersistenceError>;

    /// Per-device bandwidth totals inside a window, busiest downloaders first
    async fn bandwidth_summary(
        &self,
        since: i64,
        until: i64,
    ) -> Result<Vec<BandwidthSummary>, PersistenceError>;

    /// Per-device notification counts inside a window, noisiest first
    async fn anomaly_summary(
        &self,
        since: i64,
        until: i64,
    ) -> Result<Vec<AnomalySummary>, PersistenceError>;

    /// Cheap connectivity probe used by the hourly health check
    async fn ping(&self) -> Result<(), PersistenceError>;
}

/// Embedded sqlite sink. Statements run on the blocking pool behind one
/// connection mutex; sqlite itself serializes writers anyway.
pub struct SqliteSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSink {
    /// Open (or create) the database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, used by tests
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), PersistenceError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                upload REAL NOT NULL,
                download REAL NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_samples_device_time
                ON samples (device_id, created_at);
            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_time
                ON notifications (created_at);",
        )?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| PersistenceError::Task("connection lock poisoned".to_string()))?;
            op(&guard).map_err(PersistenceError::from)
        })
        .await
        .map_err(|error| PersistenceError::Task(error.to_string()))?
    }
}

#[async_trait]
impl PersistenceSink for SqliteSink {
    async fn insert_sample(
        &self,
        device_id: &str,
        upload: f64,
        download: f64,
    ) -> Result<(), PersistenceError> {
        let device_id = device_id.to_string();
        let created_at = Utc::now().timestamp();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO samples (device_id, upload, download, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![device_id, upload, download, created_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_notification(
        &self,
        device_id: &str,
        kind: AnomalyKind,
        severity: Severity,
        message: &str,
    ) -> Result<(), PersistenceError> {
        let device_id = device_id.to_string();
        let kind = kind.to_string();
        let severity = severity.to_string();
        let message = message.to_string();
        let created_at = Utc::now().timestamp();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO notifications (device_id, kind, severity, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![device_id, kind, severity, message, created_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn fetch_history(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredSample>, PersistenceError> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT device_id, upload, download, created_at
                 FROM samples
                 WHERE device_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![device_id, limit as i64], |row| {
                Ok(StoredSample {
                    device_id: row.get(0)?,
                    upload: row.get(1)?,
                    download: row.get(2)?,
                    recorded_at: row.get(3)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn list_active_device_ids(&self) -> Result<Vec<String>, PersistenceError> {
        let cutoff = Utc::now().timestamp() - ACTIVE_WINDOW_SECS;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT device_id FROM samples
                 WHERE created_at >= ?1
                 ORDER BY device_id",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
            rows.collect()
        })
        .await
    }

    async fn purge_samples_before(&self, cutoff: i64) -> Result<usize, PersistenceError> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM samples WHERE created_at < ?1", params![cutoff])
        })
        .await
    }

    async fn purge_notifications_before(&self, cutoff: i64) -> Result<usize, PersistenceError> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM notifications WHERE created_at < ?1",
                params![cutoff],
            )
        })
        .await
    }

    async fn bandwidth_summary(
        &self,
        since: i64,
        until: i64,
    ) -> Result<Vec<BandwidthSummary>, PersistenceError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT device_id, SUM(upload), SUM(download), COUNT(*)
                 FROM samples
                 WHERE created_at BETWEEN ?1 AND ?2
                 GROUP BY device_id
                 ORDER BY SUM(download) DESC",
            )?;
            let rows = stmt.query_map(params![since, until], |row| {
                Ok(BandwidthSummary {
                    device_id: row.get(0)?,
                    total_upload: row.get(1)?,
                    total_download: row.get(2)?,
                    samples: row.get::<_, i64>(3)? as u64,
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn anomaly_summary(
        &self,
        since: i64,
        until: i64,
    ) -> Result<Vec<AnomalySummary>, PersistenceError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT device_id, COUNT(*), MAX(created_at)
                 FROM notifications
                 WHERE created_at BETWEEN ?1 AND ?2
                 GROUP BY device_id
                 ORDER BY COUNT(*) DESC",
            )?;
            let rows = stmt.query_map(params![since, until], |row| {
                Ok(AnomalySummary {
                    device_id: row.get(0)?,
                    anomalies: row.get::<_, i64>(1)? as u64,
                    last_seen: row.get(2)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    async fn ping(&self) -> Result<(), PersistenceError> {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |_| Ok(())))
            .await
    }
}
