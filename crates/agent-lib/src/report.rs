//! Weekly bandwidth and anomaly reporting
//!
//! Renders the prior week's per-device totals and anomaly counts to a text
//! report and writes it durably (temp file, then rename).

use crate::models::{AnomalySummary, BandwidthSummary};
use crate::persist::PersistenceSink;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const MIB: f64 = 1024.0 * 1024.0;

/// Generate the 7-day report ending at `now`; returns the report path
pub async fn generate(
    sink: &dyn PersistenceSink,
    dir: &Path,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    let since = now - chrono::Duration::days(7);
    let bandwidth = sink
        .bandwidth_summary(since.timestamp(), now.timestamp())
        .await?;
    let anomalies = sink
        .anomaly_summary(since.timestamp(), now.timestamp())
        .await?;

    let body = render(&bandwidth, &anomalies, since, now);

    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create report directory {:?}", dir))?;
    let path = dir.join(format!("network_report_{}.txt", since.format("%Y%m%d")));
    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create report file {:?}", temp_path))?;
    file.write_all(body.as_bytes())
        .context("Failed to write report body")?;
    file.sync_all().context("Failed to sync report file")?;
    fs::rename(&temp_path, &path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    Ok(path)
}

fn render(
    bandwidth: &[BandwidthSummary],
    anomalies: &[AnomalySummary],
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "Network Traffic Report: {} to {}\n",
        since.format("%Y-%m-%d"),
        until.format("%Y-%m-%d")
    ));
    out.push_str(&"=".repeat(80));
    out.push_str("\n\nBANDWIDTH USAGE SUMMARY\n");
    out.push_str(&"-".repeat(80));
    out.push('\n');

    if bandwidth.is_empty() {
        out.push_str("No bandwidth data available for this period\n");
    } else {
        for row in bandwidth {
            out.push_str(&format!("{}:\n", row.device_id));
            out.push_str(&format!("  Upload: {:.2} MB\n", row.total_upload / MIB));
            out.push_str(&format!("  Download: {:.2} MB\n", row.total_download / MIB));
            out.push_str(&format!(
                "  Total: {:.2} MB\n",
                (row.total_upload + row.total_download) / MIB
            ));
            out.push_str(&format!("  Samples: {}\n\n", row.samples));
        }
    }

    out.push_str("\nANOMALY SUMMARY\n");
    out.push_str(&"-".repeat(80));
    out.push('\n');

    if anomalies.is_empty() {
        out.push_str("No anomalies detected in this period\n");
    } else {
        for row in anomalies {
            let last_seen = DateTime::from_timestamp(row.last_seen, 0)
                .map(|ts| ts.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| row.last_seen.to_string());
            out.push_str(&format!("{}:\n", row.device_id));
            out.push_str(&format!("  Anomalies detected: {}\n", row.anomalies));
            out.push_str(&format!("  Last anomaly: {}\n\n", last_seen));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::SqliteSink;
    use tempfile::TempDir;

    #[test]
    fn test_render_sections() {
        let bandwidth = vec![BandwidthSummary {
            device_id: "laptop".to_string(),
            total_upload: 10.0 * MIB,
            total_download: 50.0 * MIB,
            samples: 1200,
        }];
        let anomalies = vec![AnomalySummary {
            device_id: "laptop".to_string(),
            anomalies: 3,
            last_seen: 1_700_000_000,
        }];

        let now = Utc::now();
        let body = render(&bandwidth, &anomalies, now - chrono::Duration::days(7), now);

        assert!(body.contains("BANDWIDTH USAGE SUMMARY"));
        assert!(body.contains("Upload: 10.00 MB"));
        assert!(body.contains("Download: 50.00 MB"));
        assert!(body.contains("Total: 60.00 MB"));
        assert!(body.contains("Anomalies detected: 3"));
    }

    #[test]
    fn test_render_empty_sections() {
        let now = Utc::now();
        let body = render(&[], &[], now - chrono::Duration::days(7), now);

        assert!(body.contains("No bandwidth data available for this period"));
        assert!(body.contains("No anomalies detected in this period"));
    }

    #[tokio::test]
    async fn test_generate_writes_report_file() {
        let dir = TempDir::new().unwrap();
        let sink = SqliteSink::open_in_memory().unwrap();
        sink.insert_sample("d1", 100.0, 200.0).await.unwrap();

        let path = generate(&sink, dir.path(), Utc::now()).await.unwrap();

        assert!(path.exists());
        let body = fs::read_to_string(&path).unwrap();
        assert!(body.contains("d1:"));
        assert!(body.contains("Network Traffic Report"));
    }
}
