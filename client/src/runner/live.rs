use crate::metrics::{MetricName, MetricReader, MetricSnapshot};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Read handles onto the metrics of runs that are still executing
#[derive(Clone, Default)]
pub struct LiveMetrics {
    runs: Arc<RwLock<BTreeMap<String, Vec<MetricReader>>>>,
}

impl LiveMetrics {
    /// Register a run's readers until the returned guard is dropped
    pub(super) fn track(&self, test_uuid: &str, readers: Vec<MetricReader>) -> LiveGuard {
        self.runs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(test_uuid.to_string(), readers);
        LiveGuard {
            live: self.clone(),
            test_uuid: test_uuid.to_string(),
        }
    }

    /// Latest snapshot of every series, ordered by test id
    pub fn snapshot(&self) -> Vec<(String, MetricName, MetricSnapshot)> {
        let runs = self.runs.read().unwrap_or_else(|e| e.into_inner());
        runs.iter()
            .flat_map(|(test_uuid, readers)| {
                readers
                    .iter()
                    .map(move |r| (test_uuid.clone(), r.name(), r.snapshot()))
            })
            .collect()
    }
}

pub(super) struct LiveGuard {
    live: LiveMetrics,
    test_uuid: String,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live
            .runs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.test_uuid);
    }
}
