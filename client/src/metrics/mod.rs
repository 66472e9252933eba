//! Running statistics over a numeric series
//!
//! One [`MetricCalculator`] per series owns the state and publishes a whole
//! [`MetricSnapshot`] after every mutation. Any number of [`MetricReader`]s
//! can look at the latest snapshot without blocking the writer.

use crate::parameter::ProbeKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    Upload,
    Download,
    Rtt,
    PacketLoss,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::Upload => "upload",
            MetricName::Download => "download",
            MetricName::Rtt => "rtt",
            MetricName::PacketLoss => "packet_loss",
        }
    }

    /// The two series tracked for each probe type
    pub fn for_probe(kind: ProbeKind) -> [MetricName; 2] {
        match kind {
            ProbeKind::Iperf3 => [MetricName::Upload, MetricName::Download],
            ProbeKind::Ping => [MetricName::Rtt, MetricName::PacketLoss],
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate state of one series; `Default` is the empty state
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub last: Option<f64>,
    /// Filled by [`MetricCalculator::calc_all`]
    pub median: Option<f64>,
    pub p95: Option<f64>,
}

pub struct MetricCalculator {
    name: MetricName,
    sum: f64,
    samples: Vec<f64>,
    current: MetricSnapshot,
    tx: watch::Sender<MetricSnapshot>,
}

impl MetricCalculator {
    pub fn new(name: MetricName) -> Self {
        let (tx, _rx) = watch::channel(MetricSnapshot::default());
        Self {
            name,
            sum: 0.0,
            samples: Vec::new(),
            current: MetricSnapshot::default(),
            tx,
        }
    }

    pub fn name(&self) -> MetricName {
        self.name
    }

    pub fn reader(&self) -> MetricReader {
        MetricReader {
            name: self.name,
            rx: self.tx.subscribe(),
        }
    }

    pub fn snapshot(&self) -> MetricSnapshot {
        self.current
    }

    pub fn update(&mut self, value: f64) {
        if !value.is_finite() {
            debug!("Ignoring non-finite {} sample {}", self.name, value);
            return;
        }

        self.sum += value;
        self.samples.push(value);

        let s = &mut self.current;
        s.count += 1;
        s.min = Some(s.min.map_or(value, |m| m.min(value)));
        s.max = Some(s.max.map_or(value, |m| m.max(value)));
        s.mean = Some(self.sum / s.count as f64);
        s.last = Some(value);

        self.publish();
    }

    pub fn reset_metric(&mut self) {
        self.sum = 0.0;
        self.samples.clear();
        self.current = MetricSnapshot::default();
        self.publish();
    }

    /// Recompute the order statistics from every retained sample
    pub fn calc_all(&mut self) {
        if self.samples.is_empty() {
            self.current.median = None;
            self.current.p95 = None;
        } else {
            let mut sorted = self.samples.clone();
            sorted.sort_by(f64::total_cmp);

            let mid = sorted.len() / 2;
            self.current.median = Some(if sorted.len() % 2 == 0 {
                (sorted[mid - 1] + sorted[mid]) / 2.0
            } else {
                sorted[mid]
            });

            // nearest rank: ceil(0.95 * n), 1-based
            let rank = (sorted.len() * 95).div_ceil(100);
            self.current.p95 = sorted.get(rank.saturating_sub(1)).copied();
        }
        self.publish();
    }

    fn publish(&self) {
        self.tx.send_replace(self.current);
    }
}

/// Cloneable read handle onto a calculator's latest snapshot
#[derive(Clone)]
pub struct MetricReader {
    name: MetricName,
    rx: watch::Receiver<MetricSnapshot>,
}

impl MetricReader {
    pub fn name(&self) -> MetricName {
        self.name
    }

    /// Latest published snapshot, still readable after the calculator is gone
    pub fn snapshot(&self) -> MetricSnapshot {
        *self.rx.borrow()
    }
}
