//! Feature construction from raw bandwidth readings
//!
//! Turns each reading into a fixed-shape feature vector using per-device
//! history: first differences against the previous reading, time-of-day
//! context, and rolling statistics over the most recent samples. All
//! per-device state here is owned by the monitor loop and never shared.

use crate::models::{DeviceReading, FeatureVector, StoredSample};
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::collections::{HashMap, VecDeque};

/// Window for rolling mean/std
const ROLLING_WINDOW: usize = 5;

/// Configuration for feature construction
#[derive(Debug, Clone)]
pub struct FeatureConfig {
    /// Maximum feature vectors retained per device
    pub history_capacity: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
        }
    }
}

/// Bounded per-device history of feature vectors, oldest first
#[derive(Debug, Default)]
pub struct DeviceHistory {
    entries: VecDeque<FeatureVector>,
}

impl DeviceHistory {
    fn push(&mut self, vector: FeatureVector, capacity: usize) {
        self.entries.push_back(vector);
        while self.entries.len() > capacity {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<FeatureVector> {
        self.entries.iter().cloned().collect()
    }
}

/// Builds feature vectors and owns all per-device history state
pub struct FeatureBuilder {
    config: FeatureConfig,
    histories: HashMap<String, DeviceHistory>,
    previous: HashMap<String, (f64, f64)>,
}

impl FeatureBuilder {
    pub fn new(config: FeatureConfig) -> Self {
        Self {
            config,
            histories: HashMap::new(),
            previous: HashMap::new(),
        }
    }

    /// Build the feature vector for one reading and append it to the
    /// device's history, evicting the oldest entry past capacity.
    ///
    /// The first sample for a device yields zero deltas. Rolling mean/std
    /// cover the last 5 entries once at least 5 exist; below that the
    /// rolling mean is the current value and the std is 0.
    pub fn build(&mut self, reading: &DeviceReading, now: DateTime<Utc>) -> FeatureVector {
        let upload = sanitize(reading.upload_rate);
        let download = sanitize(reading.download_rate);

        let (upload_change, download_change) = match self.previous.get(&reading.device_id) {
            Some((prev_up, prev_down)) => (upload - prev_up, download - prev_down),
            None => (0.0, 0.0),
        };
        self.previous
            .insert(reading.device_id.clone(), (upload, download));

        let mut vector = FeatureVector {
            upload,
            download,
            upload_change,
            download_change,
            hour_of_day: now.hour() as f64,
            day_of_week: now.weekday().num_days_from_monday() as f64,
            upload_rolling_mean: upload,
            download_rolling_mean: download,
            upload_rolling_std: 0.0,
            download_rolling_std: 0.0,
            active_time: sanitize(reading.active_time),
            connection_count: sanitize(reading.connection_count),
        };

        let capacity = self.config.history_capacity;
        let history = self.histories.entry(reading.device_id.clone()).or_default();

        // The rolling window covers the new sample plus the most recent
        // history entries.
        if history.entries.len() + 1 >= ROLLING_WINDOW {
            let mut uploads = vec![upload];
            let mut downloads = vec![download];
            for entry in history.entries.iter().rev().take(ROLLING_WINDOW - 1) {
                uploads.push(entry.upload);
                downloads.push(entry.download);
            }

            let (upload_mean, upload_std) = mean_and_std(&uploads);
            let (download_mean, download_std) = mean_and_std(&downloads);
            vector.upload_rolling_mean = upload_mean;
            vector.download_rolling_mean = download_mean;
            vector.upload_rolling_std = upload_std;
            vector.download_rolling_std = download_std;
        }

        history.push(vector.clone(), capacity);
        vector
    }

    /// Number of history entries for a device
    pub fn history_len(&self, device_id: &str) -> usize {
        self.histories.get(device_id).map_or(0, DeviceHistory::len)
    }

    /// Clone of the current history for a device, oldest first
    pub fn history_snapshot(&self, device_id: &str) -> Vec<FeatureVector> {
        self.histories
            .get(device_id)
            .map(DeviceHistory::to_vec)
            .unwrap_or_default()
    }
}

/// Rebuild a training matrix by replaying persisted samples, oldest first,
/// through the same feature logic the live path uses.
pub fn training_frame(samples: &[StoredSample]) -> Vec<FeatureVector> {
    let mut builder = FeatureBuilder::new(FeatureConfig {
        history_capacity: samples.len().max(1),
    });

    samples
        .iter()
        .map(|sample| {
            let reading = DeviceReading {
                device_id: sample.device_id.clone(),
                address: None,
                hostname: None,
                upload_rate: sample.upload,
                download_rate: sample.download,
                connection_count: 0.0,
                active_time: 0.0,
            };
            let recorded = DateTime::from_timestamp(sample.recorded_at, 0).unwrap_or_else(Utc::now);
            builder.build(&reading, recorded)
        })
        .collect()
}

/// Mean and sample standard deviation; std is 0 below two points
fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    (mean, variance.sqrt())
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(device_id: &str, upload: f64, download: f64) -> DeviceReading {
        DeviceReading {
            device_id: device_id.to_string(),
            address: Some("192.168.1.2".to_string()),
            hostname: Some("host".to_string()),
            upload_rate: upload,
            download_rate: download,
            connection_count: 2.0,
            active_time: 30.0,
        }
    }

    #[test]
    fn test_first_sample_has_zero_deltas() {
        let mut builder = FeatureBuilder::new(FeatureConfig::default());
        let vector = builder.build(&reading("d1", 100.0, 200.0), Utc::now());

        assert_eq!(vector.upload, 100.0);
        assert_eq!(vector.upload_change, 0.0);
        assert_eq!(vector.download_change, 0.0);
    }

    #[test]
    fn test_deltas_against_previous_reading() {
        let mut builder = FeatureBuilder::new(FeatureConfig::default());
        builder.build(&reading("d1", 100.0, 200.0), Utc::now());
        let vector = builder.build(&reading("d1", 150.0, 180.0), Utc::now());

        assert_eq!(vector.upload_change, 50.0);
        assert_eq!(vector.download_change, -20.0);
    }

    #[test]
    fn test_deltas_are_per_device() {
        let mut builder = FeatureBuilder::new(FeatureConfig::default());
        builder.build(&reading("d1", 100.0, 100.0), Utc::now());
        let other = builder.build(&reading("d2", 40.0, 40.0), Utc::now());

        assert_eq!(other.upload_change, 0.0);
    }

    #[test]
    fn test_rolling_stats_below_window() {
        let mut builder = FeatureBuilder::new(FeatureConfig::default());
        builder.build(&reading("d1", 10.0, 10.0), Utc::now());
        let vector = builder.build(&reading("d1", 30.0, 50.0), Utc::now());

        // Fewer than 5 entries: rolling mean is the current value, std is 0
        assert_eq!(vector.upload_rolling_mean, 30.0);
        assert_eq!(vector.download_rolling_mean, 50.0);
        assert_eq!(vector.upload_rolling_std, 0.0);
    }

    #[test]
    fn test_rolling_stats_over_five_known_samples() {
        let mut builder = FeatureBuilder::new(FeatureConfig::default());
        let uploads = [2.0, 4.0, 6.0, 8.0, 10.0];
        let mut last = None;
        for upload in uploads {
            last = Some(builder.build(&reading("d1", upload, 1.0), Utc::now()));
        }

        let vector = last.unwrap();
        assert!((vector.upload_rolling_mean - 6.0).abs() < 1e-9);
        // Sample standard deviation of 2,4,6,8,10
        assert!((vector.upload_rolling_std - 10.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_rolling_stats_cover_only_last_five() {
        let mut builder = FeatureBuilder::new(FeatureConfig::default());
        for upload in [1000.0, 2.0, 4.0, 6.0, 8.0, 10.0] {
            builder.build(&reading("d1", upload, 1.0), Utc::now());
        }

        let vector = builder.history_snapshot("d1").pop().unwrap();
        assert!((vector.upload_rolling_mean - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_history_evicts_oldest_at_capacity() {
        let mut builder = FeatureBuilder::new(FeatureConfig {
            history_capacity: 3,
        });
        for upload in [1.0, 2.0, 3.0, 4.0] {
            builder.build(&reading("d1", upload, 0.0), Utc::now());
        }

        let history = builder.history_snapshot("d1");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].upload, 2.0);
        assert_eq!(history[2].upload, 4.0);
    }

    #[test]
    fn test_non_finite_rates_coerce_to_zero() {
        let mut builder = FeatureBuilder::new(FeatureConfig::default());
        let vector = builder.build(&reading("d1", f64::NAN, f64::INFINITY), Utc::now());

        assert_eq!(vector.upload, 0.0);
        assert_eq!(vector.download, 0.0);
    }

    #[test]
    fn test_training_frame_replays_chronologically() {
        let samples: Vec<StoredSample> = (0..6)
            .map(|i| StoredSample {
                device_id: "d1".to_string(),
                upload: 10.0 * (i + 1) as f64,
                download: 5.0,
                recorded_at: 1_700_000_000 + i * 2,
            })
            .collect();

        let frame = training_frame(&samples);
        assert_eq!(frame.len(), 6);
        assert_eq!(frame[0].upload_change, 0.0);
        assert_eq!(frame[1].upload_change, 10.0);
        // Last entry has a full 5-sample window: 20..=60
        assert!((frame[5].upload_rolling_mean - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_mean_and_std_edge_cases() {
        assert_eq!(mean_and_std(&[]), (0.0, 0.0));
        assert_eq!(mean_and_std(&[7.0]), (7.0, 0.0));
    }
}
