use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::signal::{Metric, StatKind};
use crate::source::RawSample;

/// One statistic of one metric in one bucket.
///
/// `value` is `None` only for `Stddev` in a bucket with a single sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketStat {
    pub bucket_start: DateTime<Utc>,
    pub metric: Metric,
    pub stat: StatKind,
    pub value: Option<f64>,
}

/// Output of one aggregation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    /// Stats ordered by (bucket_start, metric, stat).
    pub stats: Vec<BucketStat>,
    /// Number of distinct buckets that held at least one sample.
    pub buckets: usize,
}

impl Aggregation {
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

/// Descriptive statistics over a set of values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Sample standard deviation; `None` below two values.
    pub stddev: Option<f64>,
}

impl Summary {
    /// Summarizes `values`, sorting them in place so the reduction order is
    /// canonical. Returns `None` for an empty slice.
    pub fn of(values: &mut [f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        values.sort_by(f64::total_cmp);

        let count = values.len();
        let n = count as f64;
        let sum: f64 = values.iter().sum();
        let mean = if sum.is_finite() {
            sum / n
        } else {
            values.iter().map(|v| v / n).sum()
        };

        // Deviations are scaled by the largest one so squaring cannot overflow.
        let stddev = (count >= 2).then(|| {
            let scale = values.iter().map(|v| (v - mean).abs()).fold(0.0, f64::max);
            if scale == 0.0 {
                return 0.0;
            }
            let sum_sq: f64 = values
                .iter()
                .map(|v| {
                    let d = (v - mean) / scale;
                    d * d
                })
                .sum();
            scale * (sum_sq / (n - 1.0)).sqrt()
        });

        Some(Self {
            count,
            mean,
            min: values[0],
            max: values[count - 1],
            stddev,
        })
    }

    /// Returns the value for one statistic.
    pub fn stat(&self, stat: StatKind) -> Option<f64> {
        match stat {
            StatKind::Mean => Some(self.mean),
            StatKind::Min => Some(self.min),
            StatKind::Max => Some(self.max),
            StatKind::Stddev => self.stddev,
        }
    }
}

/// Returns the start of the epoch-anchored bucket containing `t`.
///
/// `width_ms` must be positive.
pub fn bucket_start(t: DateTime<Utc>, width_ms: i64) -> DateTime<Utc> {
    let ms = t.timestamp_millis();
    let start = ms.div_euclid(width_ms) * width_ms;
    DateTime::from_timestamp_millis(start).unwrap_or(t)
}

/// Buckets samples into fixed-width, epoch-anchored windows and computes
/// mean, min, max and sample stddev per (bucket, metric).
///
/// Only (bucket, metric) pairs with at least one sample are emitted. The
/// result does not depend on the order of `samples`.
pub fn aggregate(samples: &[RawSample], width: Duration) -> Aggregation {
    let width_ms = i64::try_from(width.as_millis()).unwrap_or(i64::MAX).max(1);

    let mut groups: BTreeMap<(DateTime<Utc>, Metric), Vec<f64>> = BTreeMap::new();
    for sample in samples {
        groups
            .entry((bucket_start(sample.timestamp, width_ms), sample.metric))
            .or_default()
            .push(sample.value);
    }

    let mut stats = Vec::with_capacity(groups.len() * StatKind::ALL.len());
    let mut buckets = 0usize;
    let mut last_bucket = None;

    for ((bucket_start, metric), mut values) in groups {
        let Some(summary) = Summary::of(&mut values) else {
            continue;
        };

        if last_bucket != Some(bucket_start) {
            buckets += 1;
            last_bucket = Some(bucket_start);
        }

        for stat in StatKind::ALL {
            stats.push(BucketStat {
                bucket_start,
                metric,
                stat,
                value: summary.stat(stat),
            });
        }
    }

    Aggregation { stats, buckets }
}

/// Summarizes the raw input per metric, for partition observability.
pub fn summarize_by_metric(samples: &[RawSample]) -> BTreeMap<Metric, Summary> {
    let mut values: BTreeMap<Metric, Vec<f64>> = BTreeMap::new();
    for sample in samples {
        values.entry(sample.metric).or_default().push(sample.value);
    }

    values
        .into_iter()
        .filter_map(|(metric, mut v)| Summary::of(&mut v).map(|s| (metric, s)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    const TEN_MINUTES: Duration = Duration::from_secs(600);

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 10, h, m, s).unwrap()
    }

    fn minute_series(start: DateTime<Utc>, metric: Metric, values: &[f64]) -> Vec<RawSample> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| RawSample::new(start + TimeDelta::minutes(i as i64), metric, v))
            .collect()
    }

    fn find(
        agg: &Aggregation,
        bucket: DateTime<Utc>,
        metric: Metric,
        stat: StatKind,
    ) -> Option<f64> {
        agg.stats
            .iter()
            .find(|s| s.bucket_start == bucket && s.metric == metric && s.stat == stat)
            .and_then(|s| s.value)
    }

    #[test]
    fn test_bucket_start_anchored_to_epoch() {
        let width_ms = 600_000;
        assert_eq!(bucket_start(at(0, 0, 0), width_ms), at(0, 0, 0));
        assert_eq!(bucket_start(at(0, 9, 59), width_ms), at(0, 0, 0));
        assert_eq!(bucket_start(at(0, 10, 0), width_ms), at(0, 10, 0));
        assert_eq!(bucket_start(at(13, 47, 12), width_ms), at(13, 40, 0));
    }

    #[test]
    fn test_bucket_start_before_epoch() {
        let t = DateTime::from_timestamp_millis(-1).unwrap();
        let start = bucket_start(t, 600_000);
        assert_eq!(start.timestamp_millis(), -600_000);
    }

    #[test]
    fn test_ten_minute_wind_speed_bucket() {
        let values: Vec<f64> = (5..=14).map(f64::from).collect();
        let samples = minute_series(at(0, 0, 0), Metric::WindSpeed, &values);

        let agg = aggregate(&samples, TEN_MINUTES);

        assert_eq!(agg.buckets, 1);
        assert_eq!(agg.stats.len(), 4);
        let bucket = at(0, 0, 0);
        assert_eq!(find(&agg, bucket, Metric::WindSpeed, StatKind::Mean), Some(9.5));
        assert_eq!(find(&agg, bucket, Metric::WindSpeed, StatKind::Min), Some(5.0));
        assert_eq!(find(&agg, bucket, Metric::WindSpeed, StatKind::Max), Some(14.0));

        let stddev = find(&agg, bucket, Metric::WindSpeed, StatKind::Stddev).expect("defined");
        assert!((stddev - (82.5f64 / 9.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_single_sample_bucket_has_undefined_stddev() {
        let samples = vec![RawSample::new(at(0, 3, 0), Metric::Power, 42.0)];
        let agg = aggregate(&samples, TEN_MINUTES);

        assert_eq!(agg.stats.len(), 4);
        let bucket = at(0, 0, 0);
        assert_eq!(find(&agg, bucket, Metric::Power, StatKind::Mean), Some(42.0));
        assert_eq!(find(&agg, bucket, Metric::Power, StatKind::Min), Some(42.0));
        assert_eq!(find(&agg, bucket, Metric::Power, StatKind::Max), Some(42.0));

        let stddev = agg
            .stats
            .iter()
            .find(|s| s.stat == StatKind::Stddev)
            .expect("stddev row present");
        assert_eq!(stddev.value, None);
    }

    #[test]
    fn test_empty_input() {
        let agg = aggregate(&[], TEN_MINUTES);
        assert!(agg.is_empty());
        assert_eq!(agg.buckets, 0);
    }

    #[test]
    fn test_metric_missing_from_bucket_is_absent() {
        let mut samples = minute_series(at(0, 0, 0), Metric::WindSpeed, &[1.0, 2.0]);
        samples.extend(minute_series(at(0, 10, 0), Metric::Power, &[3.0, 4.0]));

        let agg = aggregate(&samples, TEN_MINUTES);

        assert_eq!(agg.buckets, 2);
        assert_eq!(agg.stats.len(), 8);
        assert!(find(&agg, at(0, 0, 0), Metric::Power, StatKind::Mean).is_none());
        assert!(find(&agg, at(0, 10, 0), Metric::WindSpeed, StatKind::Mean).is_none());
    }

    #[test]
    fn test_gaps_produce_no_buckets() {
        let mut samples = minute_series(at(0, 0, 0), Metric::Power, &[1.0]);
        samples.extend(minute_series(at(5, 0, 0), Metric::Power, &[2.0]));

        let agg = aggregate(&samples, TEN_MINUTES);
        assert_eq!(agg.buckets, 2);
        assert!(agg
            .stats
            .iter()
            .all(|s| s.bucket_start == at(0, 0, 0) || s.bucket_start == at(5, 0, 0)));
    }

    #[test]
    fn test_aggregation_independent_of_input_order() {
        let values = [0.1, 0.7, 1e9, 0.3, -2.5, 1e-9, 3.3, 0.2];
        let mut samples = minute_series(at(1, 0, 0), Metric::WindSpeed, &values);
        samples.extend(minute_series(at(1, 0, 0), Metric::Power, &values));

        let forward = aggregate(&samples, TEN_MINUTES);
        samples.reverse();
        let reversed = aggregate(&samples, TEN_MINUTES);
        samples.swap(0, 5);
        samples.swap(2, 9);
        let shuffled = aggregate(&samples, TEN_MINUTES);

        assert_eq!(forward, reversed);
        assert_eq!(forward, shuffled);
    }

    #[test]
    fn test_adjacent_ranges_share_boundaries() {
        let values: Vec<f64> = (0..30).map(f64::from).collect();
        let samples = minute_series(at(2, 0, 0), Metric::Power, &values);

        let whole = aggregate(&samples, TEN_MINUTES);
        let mut split = aggregate(&samples[..15], TEN_MINUTES);
        let second = aggregate(&samples[15..], TEN_MINUTES);

        let whole_starts: Vec<_> = whole.stats.iter().map(|s| s.bucket_start).collect();
        split.stats.extend(second.stats);
        let mut split_starts: Vec<_> = split.stats.iter().map(|s| s.bucket_start).collect();
        split_starts.dedup();

        let mut whole_dedup = whole_starts.clone();
        whole_dedup.dedup();
        assert_eq!(whole_dedup, split_starts);
    }

    #[test]
    fn test_mean_min_max_for_many_samples() {
        let values = [3.5, -1.0, 8.25, 0.0, 2.0];
        let samples = minute_series(at(0, 20, 0), Metric::Power, &values);
        let agg = aggregate(&samples, TEN_MINUTES);
        let bucket = at(0, 20, 0);

        let expected_mean = values.iter().sum::<f64>() / values.len() as f64;
        let mean = find(&agg, bucket, Metric::Power, StatKind::Mean).expect("mean");
        assert!((mean - expected_mean).abs() < 1e-12);
        assert_eq!(find(&agg, bucket, Metric::Power, StatKind::Min), Some(-1.0));
        assert_eq!(find(&agg, bucket, Metric::Power, StatKind::Max), Some(8.25));
    }

    #[test]
    fn test_summary_of() {
        assert!(Summary::of(&mut []).is_none());

        let single = Summary::of(&mut [4.0]).expect("summary");
        assert_eq!(single.count, 1);
        assert_eq!(single.stddev, None);

        let many = Summary::of(&mut [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).expect("summary");
        assert_eq!(many.mean, 5.0);
        let expected = (32.0f64 / 7.0).sqrt();
        assert!((many.stddev.expect("defined") - expected).abs() < 1e-12);
    }

    #[test]
    fn test_summary_of_values_near_f64_max() {
        let same = Summary::of(&mut [1.5e308, 1.5e308]).expect("summary");
        assert_eq!(same.mean, 1.5e308);
        assert_eq!(same.stddev, Some(0.0));

        let spread = Summary::of(&mut [1.0e308, -1.0e308, 1.5e308]).expect("summary");
        assert!(spread.mean.is_finite());
        let stddev = spread.stddev.expect("defined");
        assert!(stddev.is_finite() && stddev > 1.0e308, "{stddev}");
    }

    #[test]
    fn test_summarize_by_metric() {
        let mut samples = minute_series(at(0, 0, 0), Metric::WindSpeed, &[1.0, 3.0]);
        samples.extend(minute_series(at(0, 0, 0), Metric::Power, &[10.0]));

        let summaries = summarize_by_metric(&samples);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[&Metric::WindSpeed].mean, 2.0);
        assert_eq!(summaries[&Metric::Power].count, 1);
    }
}
