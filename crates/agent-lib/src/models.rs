//! Core data models for the bandwidth monitoring agent

use serde::{Deserialize, Deserializer, Serialize};

/// Reserved device id for system-level notifications (health failures)
pub const SYSTEM_DEVICE_ID: &str = "system";

/// One per-device reading returned by the telemetry endpoint.
///
/// Rates occasionally arrive as strings; anything that does not parse as a
/// finite number coerces to 0.0 rather than failing the whole fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReading {
    /// Stable device identifier assigned by the external device registry
    #[serde(rename = "MACAddress")]
    pub device_id: String,
    #[serde(rename = "IPAddress", default)]
    pub address: Option<String>,
    #[serde(rename = "HostName", default)]
    pub hostname: Option<String>,
    /// Current upload rate in B/s
    #[serde(rename = "UpRate", default, deserialize_with = "lenient_f64")]
    pub upload_rate: f64,
    /// Current download rate in B/s
    #[serde(rename = "DownRate", default, deserialize_with = "lenient_f64")]
    pub download_rate: f64,
    #[serde(rename = "ConnectionCount", default, deserialize_with = "lenient_f64")]
    pub connection_count: f64,
    #[serde(rename = "ActiveTime", default, deserialize_with = "lenient_f64")]
    pub active_time: f64,
}

impl DeviceReading {
    /// Human-readable device label for notification messages
    pub fn display_name(&self) -> String {
        let hostname = self.hostname.as_deref().unwrap_or("Unknown");
        let address = self.address.as_deref().unwrap_or("Unknown IP");
        format!("{} ({})", hostname, address)
    }
}

/// Fixed-schema feature vector derived from one sample and its history.
///
/// Field order is the persisted-model column order; changing it invalidates
/// every model on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub upload: f64,
    pub download: f64,
    pub upload_change: f64,
    pub download_change: f64,
    pub hour_of_day: f64,
    pub day_of_week: f64,
    pub upload_rolling_mean: f64,
    pub download_rolling_mean: f64,
    pub upload_rolling_std: f64,
    pub download_rolling_std: f64,
    pub active_time: f64,
    pub connection_count: f64,
}

impl FeatureVector {
    /// Number of feature columns
    pub const LEN: usize = 12;

    /// Flatten into the fixed column order
    pub fn to_row(&self) -> [f64; Self::LEN] {
        [
            self.upload,
            self.download,
            self.upload_change,
            self.download_change,
            self.hour_of_day,
            self.day_of_week,
            self.upload_rolling_mean,
            self.download_rolling_mean,
            self.upload_rolling_std,
            self.download_rolling_std,
            self.active_time,
            self.connection_count,
        ]
    }
}

/// One persisted bandwidth sample, as returned by the persistence sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSample {
    pub device_id: String,
    pub upload: f64,
    pub download: f64,
    /// Unix timestamp (seconds)
    pub recorded_at: i64,
}

/// Per-device bandwidth totals over a reporting window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthSummary {
    pub device_id: String,
    pub total_upload: f64,
    pub total_download: f64,
    pub samples: u64,
}

/// Per-device anomaly counts over a reporting window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalySummary {
    pub device_id: String,
    pub anomalies: u64,
    /// Unix timestamp of the most recent anomaly in the window
    pub last_seen: i64,
}

/// Accept a JSON number, a numeric string, or null; coerce everything else
/// (and non-finite values) to 0.0.
fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
        Other(serde::de::IgnoredAny),
    }

    let value = match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => n,
        Some(Raw::Text(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        Some(Raw::Other(_)) | None => 0.0,
    };

    Ok(if value.is_finite() { value } else { 0.0 })
}
