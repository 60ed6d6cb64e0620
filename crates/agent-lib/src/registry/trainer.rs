//! Bounded background training pool
//!
//! Drains the registry's job queue with a fixed number of concurrent fits.
//! The queue capacity plus this concurrency bound is the backpressure: a
//! retraining storm drops jobs at the queue instead of growing without
//! limit, and dropped devices are retried on a later cycle or sweep.

use super::{ModelRegistry, TrainJob};
use crate::error::TrainError;
use crate::features;
use crate::observability::AgentMetrics;
use crate::persist::PersistenceSink;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, info, warn};

/// Runs queued training jobs until shutdown
pub struct Trainer {
    registry: Arc<ModelRegistry>,
    sink: Arc<dyn PersistenceSink>,
    jobs: mpsc::Receiver<TrainJob>,
    workers: usize,
    metrics: AgentMetrics,
}

impl Trainer {
    pub(crate) fn new(
        registry: Arc<ModelRegistry>,
        sink: Arc<dyn PersistenceSink>,
        jobs: mpsc::Receiver<TrainJob>,
        workers: usize,
    ) -> Self {
        Self {
            registry,
            sink,
            jobs,
            workers,
            metrics: AgentMetrics::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(workers = self.workers, "starting model training pool");
        let slots = Arc::new(Semaphore::new(self.workers));

        loop {
            tokio::select! {
                job = self.jobs.recv() => {
                    let Some(job) = job else { break };
                    let permit = match Arc::clone(&slots).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    let registry = Arc::clone(&self.registry);
                    let sink = Arc::clone(&self.sink);
                    let metrics = self.metrics.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        run_job(registry, sink, metrics, job).await;
                    });
                }
                _ = shutdown.recv() => {
                    info!("shutting down model training pool");
                    break;
                }
            }
        }
    }
}

async fn run_job(
    registry: Arc<ModelRegistry>,
    sink: Arc<dyn PersistenceSink>,
    metrics: AgentMetrics,
    job: TrainJob,
) {
    let device_id = job.device_id;
    let start = Instant::now();

    let history = match job.history {
        Some(history) => history,
        None => {
            match sink
                .fetch_history(&device_id, registry.history_fetch_limit())
                .await
            {
                Ok(mut samples) => {
                    // Newest-first from the sink; replay oldest-first
                    samples.reverse();
                    features::training_frame(&samples)
                }
                Err(error) => {
                    warn!(
                        device_id = %device_id,
                        error = %error,
                        "could not fetch training history"
                    );
                    registry.clear_pending(&device_id);
                    return;
                }
            }
        }
    };

    let samples = history.len();
    match registry.train(&device_id, history).await {
        Ok(()) => {
            metrics.inc_models_trained();
            metrics.observe_training_latency(start.elapsed().as_secs_f64());
            info!(
                device_id = %device_id,
                samples,
                elapsed_ms = start.elapsed().as_millis(),
                "model trained"
            );
        }
        Err(TrainError::InsufficientData { got, need }) => {
            debug!(device_id = %device_id, got, need, "not enough data to train");
        }
        Err(error) => {
            metrics.inc_training_failures();
            warn!(device_id = %device_id, error = %error, "model training failed");
        }
    }

    registry.clear_pending(&device_id);
}
