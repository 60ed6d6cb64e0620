//! Model store seam and the filesystem implementation
//!
//! One persisted bundle per device, written temp-then-rename so a reader
//! never observes a partial model. Unreadable or corrupt bundles are
//! treated as missing (the device just needs training again).

use crate::detector::AnomalyModel;
use crate::error::StoreError;
use async_trait::async_trait;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

/// Durable per-device model storage
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Load the persisted model for a device, if one exists
    async fn load(&self, device_id: &str) -> Result<Option<AnomalyModel>, StoreError>;

    /// Persist a model, atomically replacing any previous one
    async fn save(&self, device_id: &str, model: &AnomalyModel) -> Result<(), StoreError>;
}

/// Filesystem model store: one JSON document per device
pub struct FsModelStore {
    dir: PathBuf,
}

impl FsModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn model_path(&self, device_id: &str) -> PathBuf {
        // Device ids are MAC-like and may contain separators; keep the
        // file name filesystem-safe.
        let safe: String = device_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("device_{}.json", safe))
    }
}

#[async_trait]
impl ModelStore for FsModelStore {
    async fn load(&self, device_id: &str) -> Result<Option<AnomalyModel>, StoreError> {
        let path = self.model_path(device_id);
        let device_id = device_id.to_string();
        tokio::task::spawn_blocking(move || {
            if !path.exists() {
                return Ok(None);
            }
            let bytes = fs::read(&path)?;
            match serde_json::from_slice::<AnomalyModel>(&bytes) {
                Ok(model) => Ok(Some(model)),
                Err(error) => {
                    warn!(
                        device_id = %device_id,
                        path = %path.display(),
                        error = %error,
                        "discarding unreadable model bundle"
                    );
                    Ok(None)
                }
            }
        })
        .await
        .map_err(|error| StoreError::Task(error.to_string()))?
    }

    async fn save(&self, device_id: &str, model: &AnomalyModel) -> Result<(), StoreError> {
        let path = self.model_path(device_id);
        let bytes = serde_json::to_vec(model)?;
        tokio::task::spawn_blocking(move || {
            let temp_path = path.with_extension("tmp");
            let mut file = File::create(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&temp_path, &path)?;
            Ok(())
        })
        .await
        .map_err(|error| StoreError::Task(error.to_string()))?
    }
}
