//! Console status output and CSV export

use crate::metrics::{MetricName, MetricSnapshot};
use crate::pipeline::PipelineEvent;
use crate::runner::RunState;
use crate::storage::RunSummary;
use crate::upload::UploadStatus;
use anyhow::{Context, Result};
use chrono::DateTime;
use std::path::Path;
use tokio::sync::broadcast;
use tracing::warn;

const METRIC_COLUMNS: [MetricName; 4] = [
    MetricName::Upload,
    MetricName::Download,
    MetricName::Rtt,
    MetricName::PacketLoss,
];

/// Prints pipeline events as they happen
pub struct StatusPrinter {
    /// Also print every metric update
    verbose: bool,
}

impl StatusPrinter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Runs until the bus closes
    pub async fn run(self, mut rx: broadcast::Receiver<PipelineEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(line) = self.format(&event) {
                        println!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), line);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Status output skipped {} events", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub fn format(&self, event: &PipelineEvent) -> Option<String> {
        match event {
            PipelineEvent::RunStateChanged {
                test_uuid,
                probe,
                state,
                reason,
            } => Some(match (state, reason) {
                (RunState::Failed, Some(reason)) => {
                    format!("{} {} -> FAILED: {}", probe, short(test_uuid), reason)
                }
                _ => format!("{} {} -> {}", probe, short(test_uuid), state.as_str()),
            }),
            PipelineEvent::MetricUpdated {
                test_uuid,
                name,
                snapshot,
            } if self.verbose => Some(format!(
                "{} {}: {}",
                short(test_uuid),
                name,
                describe(*name, snapshot)
            )),
            PipelineEvent::MetricUpdated { .. } => None,
            PipelineEvent::Encoded {
                test_uuid,
                points,
                path,
            } => Some(format!(
                "{} encoded {} points to {}",
                short(test_uuid),
                points,
                path.display()
            )),
            PipelineEvent::EncodingFailed { test_uuid, error } => {
                Some(format!("{} encoding FAILED: {}", short(test_uuid), error))
            }
            PipelineEvent::Upload(status) => match status {
                UploadStatus::Delivered { points } => Some(format!("uploaded {} points", points)),
                UploadStatus::Failed { points, error } => {
                    Some(format!("upload of {} points FAILED: {}", points, error))
                }
                UploadStatus::Backpressure { dropped_points } => Some(format!(
                    "upload buffer full, dropped {} points",
                    dropped_points
                )),
                UploadStatus::Retrying { .. } | UploadStatus::SinkUnavailable
                    if !self.verbose =>
                {
                    None
                }
                UploadStatus::Retrying {
                    attempt, delay_ms, ..
                } => Some(format!("upload attempt {} failed, retry in {}ms", attempt, delay_ms)),
                UploadStatus::SinkUnavailable => Some("sink unreachable".to_string()),
            },
        }
    }
}

fn short(test_uuid: &str) -> &str {
    test_uuid.get(..8).unwrap_or(test_uuid)
}

/// Human-readable one-liner for a metric snapshot
pub fn describe(name: MetricName, s: &MetricSnapshot) -> String {
    let (scale, unit) = match name {
        MetricName::Upload | MetricName::Download => (1e-6, "Mbit/s"),
        MetricName::Rtt => (1.0, "ms"),
        MetricName::PacketLoss => (1.0, "%"),
    };
    let fmt = |v: Option<f64>| {
        v.map(|v| format!("{:.2}", v * scale))
            .unwrap_or_else(|| "-".to_string())
    };
    format!(
        "last {} {}, mean {}, min {}, max {} (n={})",
        fmt(s.last),
        unit,
        fmt(s.mean),
        fmt(s.min),
        fmt(s.max),
        s.count
    )
}

/// Export run summaries as CSV
pub fn export_csv(runs: &[RunSummary], output_path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;

    let mut header = vec![
        "test_uuid".to_string(),
        "probe".to_string(),
        "state".to_string(),
        "reason".to_string(),
        "started_at".to_string(),
        "finished_at".to_string(),
        "duration_s".to_string(),
        "exit_code".to_string(),
        "completion".to_string(),
    ];
    for name in METRIC_COLUMNS {
        for stat in ["count", "mean", "min", "max", "median", "p95"] {
            header.push(format!("{}_{}", name, stat));
        }
    }
    writer.write_record(&header)?;

    for run in runs {
        let mut record = vec![
            run.test_uuid.clone(),
            run.probe.clone(),
            run.state.clone(),
            run.reason.clone().unwrap_or_default(),
            rfc3339(run.started_at),
            run.finished_at.map(rfc3339).unwrap_or_default(),
            run.finished_at
                .map(|end| format!("{:.3}", (end - run.started_at) as f64 / 1000.0))
                .unwrap_or_default(),
            run.exit_code.map(|c| c.to_string()).unwrap_or_default(),
            run.completion.clone(),
        ];

        for name in METRIC_COLUMNS {
            match run.metrics.get(&name).filter(|s| s.count > 0) {
                Some(s) => {
                    record.push(s.count.to_string());
                    for v in [s.mean, s.min, s.max, s.median, s.p95] {
                        record.push(v.map(|v| format!("{:.3}", v)).unwrap_or_default());
                    }
                }
                None => record.extend(std::iter::repeat_n(String::new(), 6)),
            }
        }
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

fn rfc3339(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::ProbeKind;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn summary() -> RunSummary {
        RunSummary {
            test_uuid: "3f2a9c1e-0000-4000-8000-000000000001".to_string(),
            probe: "ping".to_string(),
            state: "succeeded".to_string(),
            reason: None,
            started_at: 1_700_000_000_000,
            finished_at: Some(1_700_000_004_500),
            exit_code: Some(0),
            completion: "encoded".to_string(),
            metrics: BTreeMap::from([(
                MetricName::Rtt,
                MetricSnapshot {
                    count: 4,
                    min: Some(19.0),
                    max: Some(30.1),
                    mean: Some(23.6),
                    last: Some(19.0),
                    median: Some(22.65),
                    p95: Some(30.1),
                },
            )]),
        }
    }

    #[test]
    fn test_export_csv() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs.csv");
        export_csv(&[summary()], &path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.len(), 9 + 4 * 6);

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        let get = |col: &str| {
            let idx = headers.iter().position(|h| h == col).unwrap();
            rows[0][idx].to_string()
        };
        assert_eq!(get("state"), "succeeded");
        assert_eq!(get("duration_s"), "4.500");
        assert_eq!(get("rtt_count"), "4");
        assert_eq!(get("rtt_mean"), "23.600");
        assert_eq!(get("upload_count"), "");
        assert!(get("started_at").starts_with("2023-11-14T22:13:20"));
    }

    #[test]
    fn test_status_lines() {
        let printer = StatusPrinter::new(false);
        let failed = PipelineEvent::RunStateChanged {
            test_uuid: "3f2a9c1e-0000".to_string(),
            probe: ProbeKind::Iperf3,
            state: RunState::Failed,
            reason: Some("test start error".to_string()),
        };
        assert_eq!(
            printer.format(&failed).unwrap(),
            "iperf3 3f2a9c1e -> FAILED: test start error"
        );

        let metric = PipelineEvent::MetricUpdated {
            test_uuid: "abc".to_string(),
            name: MetricName::Download,
            snapshot: MetricSnapshot {
                count: 1,
                last: Some(94_500_000.0),
                mean: Some(94_500_000.0),
                min: Some(94_500_000.0),
                max: Some(94_500_000.0),
                ..Default::default()
            },
        };
        assert!(printer.format(&metric).is_none());
        assert_eq!(
            StatusPrinter::new(true).format(&metric).unwrap(),
            "abc download: last 94.50 Mbit/s, mean 94.50, min 94.50, max 94.50 (n=1)"
        );

        assert!(printer
            .format(&PipelineEvent::Upload(UploadStatus::SinkUnavailable))
            .is_none());
        assert_eq!(
            printer
                .format(&PipelineEvent::Encoded {
                    test_uuid: "abc".to_string(),
                    points: 3,
                    path: PathBuf::from("omnt/ping/lineprotocol/abc.lp"),
                })
                .unwrap(),
            "abc encoded 3 points to omnt/ping/lineprotocol/abc.lp"
        );
    }
}
