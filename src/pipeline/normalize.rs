use chrono::{DateTime, Utc};

use crate::signal::Signal;

use super::aggregate::BucketStat;

/// One (timestamp, signal, value) triple in long form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedRow {
    pub timestamp: DateTime<Utc>,
    pub signal: Signal,
    pub value: f64,
}

impl NormalizedRow {
    pub fn signal_name(&self) -> &'static str {
        self.signal.name()
    }
}

/// Pivots bucket stats into long-form rows.
///
/// Stats without a value are dropped here, so no undefined value reaches the
/// resolver. Output is sorted by timestamp, then signal name.
pub fn normalize(stats: &[BucketStat]) -> Vec<NormalizedRow> {
    let mut rows: Vec<NormalizedRow> = stats
        .iter()
        .filter_map(|s| {
            s.value.map(|value| NormalizedRow {
                timestamp: s.bucket_start,
                signal: Signal::new(s.metric, s.stat),
                value,
            })
        })
        .collect();

    rows.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.signal_name().cmp(b.signal_name()))
    });

    rows
}
