//! Anomaly detection for per-device bandwidth behavior
//!
//! This module provides:
//! - The per-device model bundle (scaler, outlier estimator, optional
//!   auxiliary classifier)
//! - Model-based scoring with severity tiers and kind classification
//! - Threshold-based fallback detection when no model is available

mod classifier;
mod estimator;

pub use classifier::CentroidClassifier;
pub use estimator::{DensityEstimator, Scaler};

use crate::error::{ScoringError, TrainError};
use crate::models::FeatureVector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Synthetic positives required before the auxiliary classifier is fitted
const MIN_CLASSIFIER_POSITIVES: usize = 5;

/// Anomaly categories. Rendered as snake_case strings in notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    HighUploadAnomaly,
    UploadAnomaly,
    HighDownloadAnomaly,
    DownloadAnomaly,
    BidirectionalAnomaly,
    PatternAnomaly,
    UploadSpike,
    DownloadSpike,
    HighBandwidthUsage,
    SystemAlert,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnomalyKind::HighUploadAnomaly => "high_upload_anomaly",
            AnomalyKind::UploadAnomaly => "upload_anomaly",
            AnomalyKind::HighDownloadAnomaly => "high_download_anomaly",
            AnomalyKind::DownloadAnomaly => "download_anomaly",
            AnomalyKind::BidirectionalAnomaly => "bidirectional_anomaly",
            AnomalyKind::PatternAnomaly => "pattern_anomaly",
            AnomalyKind::UploadSpike => "upload_spike",
            AnomalyKind::DownloadSpike => "download_spike",
            AnomalyKind::HighBandwidthUsage => "high_bandwidth_usage",
            AnomalyKind::SystemAlert => "system_alert",
        };
        write!(f, "{}", name)
    }
}

/// Notification severity tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Numeric alert level (1..=3)
    pub fn level(&self) -> u8 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

/// Details of one detected anomaly
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyInfo {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub message: String,
    /// Model score, absent on the fallback path
    pub score: Option<f64>,
    /// Auxiliary classifier confidence, when a classifier exists
    pub confidence: Option<f64>,
}

/// Per-device model bundle: scaler, estimator, optional classifier.
///
/// Immutable once fitted; a retrain produces a new bundle that atomically
/// replaces this one in the registry and on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyModel {
    pub scaler: Scaler,
    pub estimator: DensityEstimator,
    pub classifier: Option<CentroidClassifier>,
    pub trained_at: DateTime<Utc>,
}

impl AnomalyModel {
    /// Fit the full bundle on a training matrix of feature vectors.
    ///
    /// Synthetic labels come from the estimator's own outlier flags; the
    /// auxiliary classifier is fitted only when enough positives exist.
    pub fn fit(
        rows: &[FeatureVector],
        contamination: f64,
        trained_at: DateTime<Utc>,
    ) -> Result<Self, TrainError> {
        if rows.is_empty() {
            return Err(TrainError::DegenerateData);
        }

        let matrix: Vec<Vec<f64>> = rows.iter().map(|v| v.to_row().to_vec()).collect();
        let scaler = Scaler::fit(&matrix);
        let scaled: Vec<Vec<f64>> = matrix
            .iter()
            .filter_map(|row| scaler.transform(row).ok())
            .collect();
        if scaled.is_empty() {
            return Err(TrainError::DegenerateData);
        }

        let estimator = DensityEstimator::fit(&scaled, contamination);
        let labels: Vec<bool> = scaled.iter().map(|row| estimator.is_outlier(row)).collect();
        let positives = labels.iter().filter(|flag| **flag).count();
        let classifier = if positives >= MIN_CLASSIFIER_POSITIVES {
            CentroidClassifier::fit(&scaled, &labels)
        } else {
            None
        };

        Ok(Self {
            scaler,
            estimator,
            classifier,
            trained_at,
        })
    }

    /// Outlier score of a feature vector; more negative = more anomalous
    pub fn score(&self, features: &FeatureVector) -> Result<f64, ScoringError> {
        let scaled = self.scaler.transform(&features.to_row())?;
        Ok(self.estimator.score(&scaled))
    }

    /// Auxiliary classifier confidence for a feature vector, if available
    pub fn confidence(&self, features: &FeatureVector) -> Option<f64> {
        let classifier = self.classifier.as_ref()?;
        let scaled = self.scaler.transform(&features.to_row()).ok()?;
        Some(classifier.confidence(&scaled))
    }

    /// Whether the model is older than the retrain interval
    pub fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.trained_at).num_seconds() >= max_age.as_secs() as i64
    }
}

/// Thresholds for scoring, severity, classification, and the fallback
/// detector. All values are configurable defaults, not constants; the
/// numbers were tuned empirically against residential traffic.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Model score below which a sample is anomalous
    pub score_threshold: f64,
    /// Score below which an anomaly is high severity
    pub high_severity_score: f64,
    /// Score below which an anomaly is medium severity
    pub medium_severity_score: f64,
    /// Upload level for upload-dominant classification
    pub upload_floor: f64,
    /// Upload level separating `upload_anomaly` from `high_upload_anomaly`
    pub upload_high: f64,
    pub download_floor: f64,
    pub download_high: f64,
    /// Both-direction level for `bidirectional_anomaly`
    pub bidirectional_floor: f64,
    /// Fallback: upload delta and level for `upload_spike`
    pub spike_upload_change: f64,
    pub spike_upload_level: f64,
    /// Fallback: download delta and level for `download_spike`
    pub spike_download_change: f64,
    pub spike_download_level: f64,
    /// Fallback: per-direction level for `high_bandwidth_usage`
    pub high_bandwidth_level: f64,
    /// Fallback: combined level that raises `high_bandwidth_usage` to high
    pub high_bandwidth_combined: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            score_threshold: -0.5,
            high_severity_score: -0.8,
            medium_severity_score: -0.65,
            upload_floor: 100.0,
            upload_high: 1000.0,
            download_floor: 200.0,
            download_high: 2000.0,
            bidirectional_floor: 50.0,
            spike_upload_change: 200.0,
            spike_upload_level: 500.0,
            spike_download_change: 500.0,
            spike_download_level: 1000.0,
            high_bandwidth_level: 1000.0,
            high_bandwidth_combined: 5000.0,
        }
    }
}

/// Scores feature vectors against a device model, degrading to threshold
/// detection when no model exists or scoring fails.
pub struct AnomalyDetector {
    config: DetectorConfig,
}

impl AnomalyDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Detect an anomaly in one feature vector. `None` means normal.
    pub fn detect(
        &self,
        device_id: &str,
        model: Option<&AnomalyModel>,
        features: &FeatureVector,
    ) -> Option<AnomalyInfo> {
        let Some(model) = model else {
            return self.fallback_detect(features);
        };

        match model.score(features) {
            Ok(score) => {
                if score < self.config.score_threshold {
                    Some(self.classify(features, score, model))
                } else {
                    None
                }
            }
            Err(error) => {
                warn!(
                    device_id = %device_id,
                    error = %error,
                    "model scoring failed, using threshold fallback"
                );
                self.fallback_detect(features)
            }
        }
    }

    /// Threshold-based detection used when no model is available
    pub fn fallback_detect(&self, features: &FeatureVector) -> Option<AnomalyInfo> {
        let c = &self.config;
        let upload = features.upload;
        let download = features.download;

        if features.upload_change > c.spike_upload_change && upload > c.spike_upload_level {
            return Some(AnomalyInfo {
                kind: AnomalyKind::UploadSpike,
                severity: Severity::Medium,
                message: format!("Sudden upload spike detected ({})", format_rate(upload)),
                score: None,
                confidence: None,
            });
        }

        if features.download_change > c.spike_download_change && download > c.spike_download_level {
            return Some(AnomalyInfo {
                kind: AnomalyKind::DownloadSpike,
                severity: Severity::Medium,
                message: format!("Sudden download spike detected ({})", format_rate(download)),
                score: None,
                confidence: None,
            });
        }

        if upload > c.high_bandwidth_level && download > c.high_bandwidth_level {
            let severity = if upload + download > c.high_bandwidth_combined {
                Severity::High
            } else {
                Severity::Medium
            };
            return Some(AnomalyInfo {
                kind: AnomalyKind::HighBandwidthUsage,
                severity,
                message: format!(
                    "High bandwidth usage detected (Up: {}, Down: {})",
                    format_rate(upload),
                    format_rate(download)
                ),
                score: None,
                confidence: None,
            });
        }

        None
    }

    fn classify(&self, features: &FeatureVector, score: f64, model: &AnomalyModel) -> AnomalyInfo {
        let c = &self.config;
        let severity = self.severity_for(score);
        let confidence = model.confidence(features);
        let upload = features.upload;
        let download = features.download;

        let (kind, message) = if features.upload_change > features.download_change
            && upload > c.upload_floor
        {
            if upload > c.upload_high {
                (
                    AnomalyKind::HighUploadAnomaly,
                    format!(
                        "Unusual high upload traffic detected ({})",
                        format_rate(upload)
                    ),
                )
            } else {
                (
                    AnomalyKind::UploadAnomaly,
                    format!("Unusual upload pattern detected ({})", format_rate(upload)),
                )
            }
        } else if features.download_change > features.upload_change && download > c.download_floor {
            if download > c.download_high {
                (
                    AnomalyKind::HighDownloadAnomaly,
                    format!(
                        "Unusual high download traffic detected ({})",
                        format_rate(download)
                    ),
                )
            } else {
                (
                    AnomalyKind::DownloadAnomaly,
                    format!(
                        "Unusual download pattern detected ({})",
                        format_rate(download)
                    ),
                )
            }
        } else if upload > c.bidirectional_floor && download > c.bidirectional_floor {
            (
                AnomalyKind::BidirectionalAnomaly,
                format!(
                    "Unusual bidirectional traffic pattern (Up: {}, Down: {})",
                    format_rate(upload),
                    format_rate(download)
                ),
            )
        } else {
            (
                AnomalyKind::PatternAnomaly,
                "Unusual network traffic pattern detected".to_string(),
            )
        };

        AnomalyInfo {
            kind,
            severity,
            message,
            score: Some(score),
            confidence,
        }
    }

    fn severity_for(&self, score: f64) -> Severity {
        if score < self.config.high_severity_score {
            Severity::High
        } else if score < self.config.medium_severity_score {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

/// Render a rate with a readable unit
pub fn format_rate(value: f64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    if value >= MIB {
        format!("{:.2} MB/s", value / MIB)
    } else if value >= KIB {
        format!("{:.2} KB/s", value / KIB)
    } else {
        format!("{:.2} B/s", value)
    }
}
