//! Folding probe outcomes into per-target statistics and alert state.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::db::{ProbeOutcome, ProbeParams, ProbeRecord, ProbeSample, ProbeStatus};

/// Outcome of a best-effort sample removal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemovalSummary {
    pub removed: usize,
    pub failed: usize,
}

/// Applies outcomes to records. Holds no state of its own besides parameters.
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    max_samples: usize,
    alert_threshold: u32,
}

impl StatsAggregator {
    pub fn new(params: &ProbeParams) -> Self {
        Self {
            max_samples: params.max_samples.max(1),
            alert_threshold: params.alert_threshold,
        }
    }

    /// Fold one outcome into `record`.
    pub fn merge(&self, record: &mut ProbeRecord, outcome: &ProbeOutcome) {
        if record.dirty_down_count {
            record.alert.down_count = 0;
            record.dirty_down_count = false;
        }

        record.sent += 1;

        let rtt_ms = match (outcome.status, outcome.rtt_ms) {
            (status, Some(rtt)) if status.is_success() => Some(rtt.max(0.0)),
            _ => None,
        };

        match rtt_ms {
            Some(rtt) => {
                record.received += 1;
                record.rtt_total += rtt;
                if record.received == 1 {
                    record.rtt_min = rtt;
                    record.rtt_max = rtt;
                } else {
                    record.rtt_min = record.rtt_min.min(rtt);
                    record.rtt_max = record.rtt_max.max(rtt);
                }
                record.rtt_avg = record.rtt_total / record.received as f64;
            }
            None => {
                record.lost += 1;
                record.alert.down_count = record.alert.down_count.saturating_add(1);
                if outcome.status == ProbeStatus::Timeout {
                    record.timeouts += 1;
                }
            }
        }

        record.loss_percentage = loss_percentage(record.lost, record.sent);
        self.push_sample(record, outcome, rtt_ms);

        record.alert.is_up = rtt_ms.is_some();
        record.alert.event_time = Some(outcome.time);
        record.alert.message = outcome.message.clone();

        if self.alert_threshold > 0 && record.alert.down_count >= self.alert_threshold {
            record.alert.alert_flag = true;
        }
    }

    fn push_sample(&self, record: &mut ProbeRecord, outcome: &ProbeOutcome, rtt_ms: Option<f64>) {
        let sample = ProbeSample {
            id: record.next_sample_id,
            record_id: record.id,
            time: outcome.time,
            status: if rtt_ms.is_some() { ProbeStatus::Ok } else { failed_status(outcome.status) },
            rtt_ms,
        };
        record.next_sample_id += 1;
        record.samples.push_back(sample);
        while record.samples.len() > self.max_samples {
            record.samples.pop_front();
        }
    }

    /// Reset counters for a fresh measurement window.
    pub fn zero(&self, record: &mut ProbeRecord) {
        record.sent = 0;
        record.received = 0;
        record.lost = 0;
        record.loss_percentage = 0.0;
        record.rtt_min = 0.0;
        record.rtt_max = 0.0;
        record.rtt_total = 0.0;
        record.rtt_avg = 0.0;
        record.timeouts = 0;
        record.samples.clear();
        record.started_at = Utc::now();
    }

    /// Remove published samples. Unknown records or samples count as failures.
    pub fn remove_samples(
        &self,
        records: &mut BTreeMap<i64, ProbeRecord>,
        record_id: i64,
        sample_ids: &[u64],
    ) -> RemovalSummary {
        let Some(record) = records.get_mut(&record_id) else {
            return RemovalSummary {
                removed: 0,
                failed: sample_ids.len(),
            };
        };

        let mut summary = RemovalSummary::default();
        for id in sample_ids {
            match record.samples.iter().position(|s| s.id == *id) {
                Some(pos) => {
                    record.samples.remove(pos);
                    summary.removed += 1;
                }
                None => summary.failed += 1,
            }
        }
        summary
    }
}

/// Restore `sent == received + lost`. Returns true if the record had drifted.
pub fn restore_sent_invariant(record: &mut ProbeRecord) -> bool {
    let expected = record.received + record.lost;
    if record.sent == expected {
        return false;
    }
    record.sent = expected;
    record.loss_percentage = loss_percentage(record.lost, record.sent);
    true
}

fn loss_percentage(lost: u64, sent: u64) -> f64 {
    if sent == 0 {
        0.0
    } else {
        lost as f64 / sent as f64 * 100.0
    }
}

// An Ok outcome without an RTT is malformed; record it as an error.
fn failed_status(status: ProbeStatus) -> ProbeStatus {
    match status {
        ProbeStatus::Ok => ProbeStatus::Error,
        other => other,
    }
}
