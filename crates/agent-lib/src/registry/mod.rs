//! Per-device model lifecycle
//!
//! The registry owns the map of active models, loads persisted bundles on
//! a miss, trains and atomically swaps replacements, and feeds the bounded
//! background training pool. The map is the only structure shared between
//! the monitor loop and training workers; its write lock is held only for
//! the entry swap, never for a fit.

mod trainer;

pub use trainer::Trainer;

use crate::detector::AnomalyModel;
use crate::error::TrainError;
use crate::models::FeatureVector;
use crate::persist::PersistenceSink;
use crate::store::ModelStore;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Training and retraining configuration
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Minimum history length before training is attempted
    pub min_samples: usize,
    /// Age after which an active model is due for retraining
    pub retrain_interval: Duration,
    /// Expected fraction of outliers in the training data
    pub contamination: f64,
    /// Samples fetched from the sink when a retrain job has no history
    pub history_fetch_limit: usize,
    /// Capacity of the retrain job queue
    pub queue_capacity: usize,
    /// Concurrent training fits
    pub workers: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            min_samples: 100,
            retrain_interval: Duration::from_secs(24 * 3600),
            contamination: 0.05,
            history_fetch_limit: 1000,
            queue_capacity: 64,
            workers: 2,
        }
    }
}

/// A unit of background training work
#[derive(Debug)]
pub(crate) struct TrainJob {
    pub device_id: String,
    /// History snapshot from the monitor loop; `None` means the worker
    /// fetches persisted samples instead (scheduler sweep path).
    pub history: Option<Vec<FeatureVector>>,
}

/// Owns one anomaly model per device
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<AnomalyModel>>>,
    /// Devices with a queued or running training job
    pending: Mutex<HashSet<String>>,
    store: Arc<dyn ModelStore>,
    config: TrainingConfig,
    jobs: mpsc::Sender<TrainJob>,
}

impl ModelRegistry {
    /// Build the registry together with its training pool. The returned
    /// `Trainer` must be spawned for background jobs to run.
    pub fn new(
        store: Arc<dyn ModelStore>,
        sink: Arc<dyn PersistenceSink>,
        config: TrainingConfig,
    ) -> (Arc<Self>, Trainer) {
        let (jobs, job_rx) = mpsc::channel(config.queue_capacity.max(1));
        let workers = config.workers.max(1);

        let registry = Arc::new(Self {
            models: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            store,
            config,
            jobs,
        });
        let trainer = Trainer::new(Arc::clone(&registry), sink, job_rx, workers);
        (registry, trainer)
    }

    /// Model currently in memory for a device
    pub fn current(&self, device_id: &str) -> Option<Arc<AnomalyModel>> {
        self.models.read().unwrap().get(device_id).cloned()
    }

    /// Active model for a device: memory first, then the persisted store.
    /// `None` means the device still needs training and callers should use
    /// fallback detection.
    pub async fn get_or_create(&self, device_id: &str) -> Option<Arc<AnomalyModel>> {
        if let Some(model) = self.current(device_id) {
            return Some(model);
        }

        match self.store.load(device_id).await {
            Ok(Some(model)) => {
                let model = Arc::new(model);
                self.install(device_id, Arc::clone(&model));
                info!(device_id = %device_id, "loaded persisted model");
                Some(model)
            }
            Ok(None) => None,
            Err(error) => {
                warn!(device_id = %device_id, error = %error, "model load failed");
                None
            }
        }
    }

    /// Train a replacement model and atomically swap it in, both in memory
    /// and in the persisted store. Below the minimum sample count this is a
    /// refusal that leaves any existing model untouched.
    pub async fn train(
        &self,
        device_id: &str,
        history: Vec<FeatureVector>,
    ) -> Result<(), TrainError> {
        if history.len() < self.config.min_samples {
            return Err(TrainError::InsufficientData {
                got: history.len(),
                need: self.config.min_samples,
            });
        }

        let contamination = self.config.contamination;
        let trained_at = Utc::now();
        let model = tokio::task::spawn_blocking(move || {
            AnomalyModel::fit(&history, contamination, trained_at)
        })
        .await
        .map_err(|error| TrainError::Task(error.to_string()))??;

        let model = Arc::new(model);
        self.install(device_id, Arc::clone(&model));
        if let Err(error) = self.store.save(device_id, &model).await {
            // The in-memory model still serves; the next retrain will try
            // the disk again.
            warn!(device_id = %device_id, error = %error, "failed to persist model");
        }
        Ok(())
    }

    /// Queue an asynchronous retrain when the active model has aged past
    /// the retrain interval. The history closure is only evaluated when a
    /// retrain is actually due. The stale model keeps serving until the
    /// replacement is swapped in.
    pub fn retrain_if_due<F>(&self, device_id: &str, history: F)
    where
        F: FnOnce() -> Vec<FeatureVector>,
    {
        let Some(model) = self.current(device_id) else {
            return;
        };
        if !model.is_stale(self.config.retrain_interval, Utc::now()) {
            return;
        }
        debug!(device_id = %device_id, "model is stale, queueing retrain");
        self.enqueue(device_id, Some(history()));
    }

    /// Queue lazy initial training for a device with no model. Ignored
    /// below the minimum sample count.
    pub fn request_training(&self, device_id: &str, history: Vec<FeatureVector>) {
        if history.len() < self.config.min_samples {
            return;
        }
        self.enqueue(device_id, Some(history));
    }

    /// Queue a retrain whose history comes from the persistence sink
    /// (the daily sweep path).
    pub fn request_retrain(&self, device_id: &str) {
        self.enqueue(device_id, None);
    }

    /// Number of models currently in memory
    pub fn model_count(&self) -> usize {
        self.models.read().unwrap().len()
    }

    pub fn min_samples(&self) -> usize {
        self.config.min_samples
    }

    pub(crate) fn history_fetch_limit(&self) -> usize {
        self.config.history_fetch_limit
    }

    fn install(&self, device_id: &str, model: Arc<AnomalyModel>) {
        // Write lock held only for the swap
        self.models
            .write()
            .unwrap()
            .insert(device_id.to_string(), model);
    }

    fn enqueue(&self, device_id: &str, history: Option<Vec<FeatureVector>>) {
        {
            let mut pending = self.pending.lock().unwrap();
            if !pending.insert(device_id.to_string()) {
                return;
            }
        }

        let job = TrainJob {
            device_id: device_id.to_string(),
            history,
        };
        match self.jobs.try_send(job) {
            Ok(()) => debug!(device_id = %device_id, "training job queued"),
            Err(TrySendError::Full(job)) => {
                warn!(device_id = %job.device_id, "training queue full, dropping job");
                self.clear_pending(&job.device_id);
            }
            Err(TrySendError::Closed(job)) => {
                debug!(device_id = %job.device_id, "training pool stopped, dropping job");
                self.clear_pending(&job.device_id);
            }
        }
    }

    pub(crate) fn clear_pending(&self, device_id: &str) {
        self.pending.lock().unwrap().remove(device_id);
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, device_id: &str) -> bool {
        self.pending.lock().unwrap().contains(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PersistenceError, StoreError};
    use crate::models::StoredSample;
    use crate::store::FsModelStore;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Sink stub for registry tests; only history fetches matter here
    struct StubSink {
        samples: StdMutex<Vec<StoredSample>>,
    }

    impl StubSink {
        fn new() -> Self {
            Self {
                samples: StdMutex::new(Vec::new()),
            }
        }

        fn with_samples(samples: Vec<StoredSample>) -> Self {
            Self {
                samples: StdMutex::new(samples),
            }
        }
    }

    #[async_trait]
    impl crate::persist::PersistenceSink for StubSink {
        async fn insert_sample(&self, _: &str, _: f64, _: f64) -> Result<(), PersistenceError> {
            Ok(())
        }

        async fn insert_notification(
            &self,
            _: &str,
            _: crate::detector::AnomalyKind,
            _: crate::detector::Severity,
            _: &str,
        ) -> Result<(), PersistenceError> {
            Ok(())
        }

        async fn fetch_history(
            &self,
            device_id: &str,
            limit: usize,
        ) -> Result<Vec<StoredSample>, PersistenceError> {
            let samples = self.samples.lock().unwrap();
            let mut matched: Vec<StoredSample> = samples
                .iter()
                .filter(|s| s.device_id == device_id)
                .cloned()
                .collect();
            matched.sort_by_key(|s| std::cmp::Reverse(s.recorded_at));
            matched.truncate(limit);
            Ok(matched)
        }

        async fn list_active_device_ids(&self) -> Result<Vec<String>, PersistenceError> {
            Ok(Vec::new())
        }

        async fn purge_samples_before(&self, _: i64) -> Result<usize, PersistenceError> {
            Ok(0)
        }

        async fn purge_notifications_before(&self, _: i64) -> Result<usize, PersistenceError> {
            Ok(0)
        }

        async fn bandwidth_summary(
            &self,
            _: i64,
            _: i64,
        ) -> Result<Vec<crate::models::BandwidthSummary>, PersistenceError> {
            Ok(Vec::new())
        }

        async fn anomaly_summary(
            &self,
            _: i64,
            _: i64,
        ) -> Result<Vec<crate::models::AnomalySummary>, PersistenceError> {
            Ok(Vec::new())
        }

        async fn ping(&self) -> Result<(), PersistenceError> {
            Ok(())
        }
    }

    /// Store stub that remembers nothing
    struct NullStore;

    #[async_trait]
    impl ModelStore for NullStore {
        async fn load(&self, _: &str) -> Result<Option<AnomalyModel>, StoreError> {
            Ok(None)
        }

        async fn save(&self, _: &str, _: &AnomalyModel) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn flat_history(count: usize) -> Vec<FeatureVector> {
        (0..count)
            .map(|i| FeatureVector {
                upload: 10.0 + (i % 4) as f64,
                download: 20.0,
                upload_change: 0.0,
                download_change: 0.0,
                hour_of_day: 12.0,
                day_of_week: 1.0,
                upload_rolling_mean: 10.0,
                download_rolling_mean: 20.0,
                upload_rolling_std: 1.0,
                download_rolling_std: 0.0,
                active_time: 0.0,
                connection_count: 0.0,
            })
            .collect()
    }

    fn test_config(min_samples: usize) -> TrainingConfig {
        TrainingConfig {
            min_samples,
            ..TrainingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_train_refuses_below_min_samples() {
        let (registry, _trainer) = ModelRegistry::new(
            Arc::new(NullStore),
            Arc::new(StubSink::new()),
            test_config(10),
        );

        let result = registry.train("d1", flat_history(5)).await;
        assert!(matches!(
            result,
            Err(TrainError::InsufficientData { got: 5, need: 10 })
        ));
        assert!(registry.current("d1").is_none());
    }

    #[tokio::test]
    async fn test_refused_train_leaves_existing_model_untouched() {
        let (registry, _trainer) = ModelRegistry::new(
            Arc::new(NullStore),
            Arc::new(StubSink::new()),
            test_config(10),
        );

        registry.train("d1", flat_history(10)).await.unwrap();
        let before = registry.current("d1").unwrap();

        let result = registry.train("d1", flat_history(3)).await;
        assert!(result.is_err());

        let after = registry.current("d1").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn test_train_installs_and_persists() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsModelStore::new(dir.path()).unwrap());
        let (registry, _trainer) =
            ModelRegistry::new(store.clone(), Arc::new(StubSink::new()), test_config(10));

        registry.train("d1", flat_history(12)).await.unwrap();
        assert_eq!(registry.model_count(), 1);
        assert!(store.load("d1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_get_or_create_loads_from_store() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsModelStore::new(dir.path()).unwrap());

        // Train through one registry, then read through a fresh one
        {
            let (registry, _trainer) =
                ModelRegistry::new(store.clone(), Arc::new(StubSink::new()), test_config(10));
            registry.train("d1", flat_history(12)).await.unwrap();
        }

        let (registry, _trainer) =
            ModelRegistry::new(store, Arc::new(StubSink::new()), test_config(10));
        assert!(registry.current("d1").is_none());
        assert!(registry.get_or_create("d1").await.is_some());
        assert_eq!(registry.model_count(), 1);
    }

    #[tokio::test]
    async fn test_get_or_create_miss_means_needs_training() {
        let (registry, _trainer) = ModelRegistry::new(
            Arc::new(NullStore),
            Arc::new(StubSink::new()),
            test_config(10),
        );
        assert!(registry.get_or_create("d1").await.is_none());
    }

    #[tokio::test]
    async fn test_request_training_respects_min_samples_and_dedupes() {
        let (registry, _trainer) = ModelRegistry::new(
            Arc::new(NullStore),
            Arc::new(StubSink::new()),
            test_config(10),
        );

        registry.request_training("d1", flat_history(3));
        assert!(!registry.is_pending("d1"));

        registry.request_training("d1", flat_history(10));
        assert!(registry.is_pending("d1"));

        // Second request while the first is pending is dropped
        registry.request_training("d1", flat_history(10));
        assert!(registry.is_pending("d1"));
    }

    #[tokio::test]
    async fn test_retrain_if_due_only_queues_stale_models() {
        let (registry, _trainer) = ModelRegistry::new(
            Arc::new(NullStore),
            Arc::new(StubSink::new()),
            test_config(10),
        );
        registry.train("d1", flat_history(10)).await.unwrap();

        registry.retrain_if_due("d1", || flat_history(10));
        assert!(!registry.is_pending("d1"));

        // Plant a stale model directly
        let stale = AnomalyModel {
            trained_at: Utc::now() - chrono::Duration::days(2),
            ..(*registry.current("d1").unwrap()).clone()
        };
        registry.install("d1", Arc::new(stale));

        registry.retrain_if_due("d1", || flat_history(10));
        assert!(registry.is_pending("d1"));
    }

    #[tokio::test]
    async fn test_trainer_processes_queued_job() {
        let (registry, trainer) = ModelRegistry::new(
            Arc::new(NullStore),
            Arc::new(StubSink::new()),
            test_config(10),
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let handle = tokio::spawn(trainer.run(shutdown_tx.subscribe()));

        registry.request_training("d1", flat_history(10));

        for _ in 0..100 {
            if registry.model_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(registry.model_count(), 1);
        assert!(!registry.is_pending("d1"));

        shutdown_tx.send(()).unwrap();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_trainer_fetches_history_for_sweep_jobs() {
        let samples: Vec<StoredSample> = (0..20)
            .map(|i| StoredSample {
                device_id: "d1".to_string(),
                upload: 10.0 + (i % 3) as f64,
                download: 20.0,
                recorded_at: 1_700_000_000 + i * 10,
            })
            .collect();
        let (registry, trainer) = ModelRegistry::new(
            Arc::new(NullStore),
            Arc::new(StubSink::with_samples(samples)),
            test_config(10),
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let handle = tokio::spawn(trainer.run(shutdown_tx.subscribe()));

        registry.request_retrain("d1");

        for _ in 0..100 {
            if registry.model_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(registry.model_count(), 1);

        shutdown_tx.send(()).unwrap();
        let _ = handle.await;
    }
}
