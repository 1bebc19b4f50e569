use crate::ipc_error::ErrorCounts;
use mediator_core::{Call, CallStatus};
use serde::Serialize;
use std::collections::BTreeMap;

/// Mean, median and sample count of a set of durations
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DurationSummary {
    pub count: usize,
    pub mean_ms: f64,
    pub median_ms: f64,
}

impl DurationSummary {
    pub fn from_samples(mut samples: Vec<f64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_by(|a, b| a.total_cmp(b));

        let count = samples.len();
        let mean_ms = samples.iter().sum::<f64>() / count as f64;
        let median_ms = if count % 2 == 0 {
            (samples[count / 2 - 1] + samples[count / 2]) / 2.0
        } else {
            samples[count / 2]
        };

        DurationSummary {
            count,
            mean_ms,
            median_ms,
        }
    }
}

/// Time spent waiting for a worker and time spent executing, per method
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodStats {
    pub method: String,
    pub called: DurationSummary,
    pub running: DurationSummary,
}

/// Group the durations of `calls` by method, sorted by method name
pub fn method_stats<'a>(calls: impl IntoIterator<Item = &'a Call>) -> Vec<MethodStats> {
    let mut samples: BTreeMap<&str, (Vec<f64>, Vec<f64>)> = BTreeMap::new();

    for call in calls {
        let entry = samples.entry(call.method.as_str()).or_default();
        if let Some(d) = call.duration_in(CallStatus::Called) {
            entry.0.push(d.num_microseconds().unwrap_or(i64::MAX) as f64 / 1000.0);
        }
        if let Some(d) = call.duration_in(CallStatus::Running) {
            entry.1.push(d.num_microseconds().unwrap_or(i64::MAX) as f64 / 1000.0);
        }
    }

    samples
        .into_iter()
        .map(|(method, (called, running))| MethodStats {
            method: method.to_string(),
            called: DurationSummary::from_samples(called),
            running: DurationSummary::from_samples(running),
        })
        .collect()
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub alias: String,
    pub workers: usize,
    pub processes: usize,
    pub running: usize,
    pub calls: usize,
    pub by_status: BTreeMap<String, usize>,
    pub pending_messages: usize,
    pub early_deaths: u32,
    pub communication_errors: u32,
    pub corruption_errors: u32,
    pub catchall_errors: u32,
}

impl PoolStats {
    pub(crate) fn with_errors(mut self, errors: &ErrorCounts) -> Self {
        self.communication_errors = errors.communication;
        self.corruption_errors = errors.corruption;
        self.catchall_errors = errors.catchall;
        self
    }
}
