//! Telemetry source seam and its HTTP implementation
//!
//! The agent pulls per-device readings from an external endpoint once per
//! poll cycle. Fetch failures are errors, never silent empty lists, so the
//! monitor loop can count them toward its backoff.

use crate::error::FetchError;
use crate::models::DeviceReading;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Pull-based telemetry endpoint
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Fetch the current reading for every tracked device
    async fn fetch(&self) -> Result<Vec<DeviceReading>, FetchError>;
}

/// HTTP telemetry source with a bounded request timeout
pub struct HttpTelemetrySource {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpTelemetrySource {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TelemetrySource for HttpTelemetrySource {
    async fn fetch(&self) -> Result<Vec<DeviceReading>, FetchError> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    FetchError::Timeout(self.timeout)
                } else {
                    FetchError::Request(error)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let readings: Vec<DeviceReading> = response.json().await.map_err(FetchError::Request)?;
        debug!(devices = readings.len(), "fetched telemetry");
        Ok(readings)
    }
}
