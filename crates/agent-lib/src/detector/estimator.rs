//! Fitted outlier estimation over standardized feature rows
//!
//! The estimator standardizes every column against the training
//! distribution and scores each row by its RMS z-distance, normalized the
//! same way ensemble outlier detectors normalize path lengths: scores fall
//! in (-1, 0], more negative meaning more anomalous. A decision offset at
//! the contamination quantile of the training scores separates the
//! synthetic outlier labels used to fit the auxiliary classifier.

use crate::error::ScoringError;
use serde::{Deserialize, Serialize};

/// Per-column standardization fitted on the training matrix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scaler {
    means: Vec<f64>,
    stds: Vec<f64>,
}

impl Scaler {
    /// Fit column means and population standard deviations. Zero-variance
    /// columns standardize with a unit divisor so they contribute nothing
    /// to the distance.
    pub fn fit(rows: &[Vec<f64>]) -> Self {
        let columns = rows.first().map_or(0, Vec::len);
        let count = rows.len().max(1) as f64;

        let mut means = vec![0.0; columns];
        for row in rows {
            for (mean, value) in means.iter_mut().zip(row) {
                *mean += value;
            }
        }
        for mean in &mut means {
            *mean /= count;
        }

        let mut stds = vec![0.0; columns];
        for row in rows {
            for ((std, value), mean) in stds.iter_mut().zip(row).zip(&means) {
                *std += (value - mean).powi(2);
            }
        }
        for std in &mut stds {
            *std = (*std / count).sqrt();
            if *std < f64::EPSILON {
                *std = 1.0;
            }
        }

        Self { means, stds }
    }

    /// Standardize a row, checking its width against the fitted columns
    pub fn transform(&self, row: &[f64]) -> Result<Vec<f64>, ScoringError> {
        if row.len() != self.means.len() {
            return Err(ScoringError::ColumnMismatch {
                got: row.len(),
                expected: self.means.len(),
            });
        }
        Ok(self.apply(row))
    }

    /// Number of fitted columns
    pub fn columns(&self) -> usize {
        self.means.len()
    }

    fn apply(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(&self.means)
            .zip(&self.stds)
            .map(|((value, mean), std)| (value - mean) / std)
            .collect()
    }
}

/// Density-based outlier scorer over standardized rows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DensityEstimator {
    /// Mean training distance, the score normalizer
    norm: f64,
    /// Contamination-quantile decision offset over training scores
    offset: f64,
    contamination: f64,
}

impl DensityEstimator {
    /// Fit on standardized training rows with the expected fraction of
    /// outliers in the data.
    pub fn fit(scaled: &[Vec<f64>], contamination: f64) -> Self {
        let distances: Vec<f64> = scaled.iter().map(|row| rms_distance(row)).collect();

        let mut norm = if distances.is_empty() {
            1.0
        } else {
            distances.iter().sum::<f64>() / distances.len() as f64
        };
        if norm < 1e-9 {
            // Degenerate (near-identical) training data still gets a usable
            // scorer: every training row scores 0 and any deviation drops
            // the score toward -1.
            norm = 1.0;
        }

        let mut scores: Vec<f64> = distances.iter().map(|d| score_for(*d, norm)).collect();
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let offset = if scores.is_empty() {
            0.0
        } else {
            let idx = ((scores.len() as f64) * contamination.clamp(0.0, 0.5)).floor() as usize;
            scores[idx.min(scores.len() - 1)]
        };

        Self {
            norm,
            offset,
            contamination,
        }
    }

    /// Score in (-1, 0]; more negative means more anomalous
    pub fn score(&self, scaled_row: &[f64]) -> f64 {
        score_for(rms_distance(scaled_row), self.norm)
    }

    /// Score relative to the calibrated offset; negative means outlier
    pub fn decision(&self, scaled_row: &[f64]) -> f64 {
        self.score(scaled_row) - self.offset
    }

    /// Outlier flag used to derive synthetic training labels
    pub fn is_outlier(&self, scaled_row: &[f64]) -> bool {
        self.decision(scaled_row) < 0.0
    }

    pub fn contamination(&self) -> f64 {
        self.contamination
    }
}

/// RMS z-distance of a standardized row
fn rms_distance(row: &[f64]) -> f64 {
    if row.is_empty() {
        return 0.0;
    }
    (row.iter().map(|z| z * z).sum::<f64>() / row.len() as f64).sqrt()
}

fn score_for(distance: f64, norm: f64) -> f64 {
    (-(distance / (2.0 * norm))).exp2() - 1.0
}
