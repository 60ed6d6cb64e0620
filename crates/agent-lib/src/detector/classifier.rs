//! Auxiliary anomaly classifier
//!
//! A nearest-centroid model fitted on the estimator's own outlier flags.
//! It never decides whether a sample is anomalous; it only attaches a
//! confidence figure to anomalies the estimator already found.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentroidClassifier {
    normal: Vec<f64>,
    anomalous: Vec<f64>,
}

impl CentroidClassifier {
    /// Fit class centroids from standardized rows and binary labels.
    /// Returns `None` unless both classes are represented.
    pub fn fit(scaled: &[Vec<f64>], labels: &[bool]) -> Option<Self> {
        let columns = scaled.first()?.len();
        let mut normal = vec![0.0; columns];
        let mut anomalous = vec![0.0; columns];
        let mut normal_count = 0usize;
        let mut anomalous_count = 0usize;

        for (row, label) in scaled.iter().zip(labels) {
            let (centroid, count) = if *label {
                (&mut anomalous, &mut anomalous_count)
            } else {
                (&mut normal, &mut normal_count)
            };
            for (sum, value) in centroid.iter_mut().zip(row) {
                *sum += value;
            }
            *count += 1;
        }

        if normal_count == 0 || anomalous_count == 0 {
            return None;
        }

        for sum in &mut normal {
            *sum /= normal_count as f64;
        }
        for sum in &mut anomalous {
            *sum /= anomalous_count as f64;
        }

        Some(Self { normal, anomalous })
    }

    /// Confidence in [0, 1] that a standardized row belongs to the
    /// anomalous class, from its relative distance to the two centroids.
    pub fn confidence(&self, scaled_row: &[f64]) -> f64 {
        let to_normal = euclidean(scaled_row, &self.normal);
        let to_anomalous = euclidean(scaled_row, &self.anomalous);
        let total = to_normal + to_anomalous;
        if total < f64::EPSILON {
            0.5
        } else {
            to_normal / total
        }
    }
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_requires_both_classes() {
        let rows = vec![vec![0.0, 0.0], vec![0.1, 0.1]];
        assert!(CentroidClassifier::fit(&rows, &[false, false]).is_none());
        assert!(CentroidClassifier::fit(&rows, &[true, true]).is_none());
        assert!(CentroidClassifier::fit(&rows, &[false, true]).is_some());
    }

    #[test]
    fn test_confidence_ordering() {
        let rows = vec![
            vec![0.0, 0.0],
            vec![0.2, -0.1],
            vec![5.0, 5.0],
            vec![5.5, 4.5],
        ];
        let labels = [false, false, true, true];
        let classifier = CentroidClassifier::fit(&rows, &labels).unwrap();

        let near_anomalous = classifier.confidence(&[5.2, 4.8]);
        let near_normal = classifier.confidence(&[0.1, 0.0]);
        assert!(near_anomalous > 0.9);
        assert!(near_normal < 0.1);
    }

    #[test]
    fn test_confidence_between_centroids() {
        let rows = vec![vec![0.0], vec![10.0]];
        let classifier = CentroidClassifier::fit(&rows, &[false, true]).unwrap();
        let midway = classifier.confidence(&[5.0]);
        assert!((midway - 0.5).abs() < 1e-9);
    }
}
