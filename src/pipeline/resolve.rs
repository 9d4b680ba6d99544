use std::collections::BTreeSet;

use crate::signal::SignalRegistry;
use crate::store::LoadRecord;

use super::normalize::NormalizedRow;

/// Result of resolving signal names against a registry snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Rows whose signal name is registered, in input order.
    pub records: Vec<LoadRecord>,
    /// Distinct signal names absent from the registry, sorted.
    pub unresolved: Vec<String>,
}

/// Maps each row's signal name to its registered id.
///
/// Pure lookup: unknown names are never created. Rows with unknown names are
/// dropped and each such name is reported once.
pub fn resolve(rows: &[NormalizedRow], registry: &SignalRegistry) -> Resolution {
    let mut records = Vec::with_capacity(rows.len());
    let mut unresolved = BTreeSet::new();

    for row in rows {
        let name = row.signal_name();
        match registry.id_of(name) {
            Some(signal_id) => records.push(LoadRecord {
                timestamp: row.timestamp,
                signal_id,
                value: row.value,
            }),
            None => {
                unresolved.insert(name);
            }
        }
    }

    Resolution {
        records,
        unresolved: unresolved.into_iter().map(str::to_string).collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::signal::{Metric, Signal, StatKind};
    use chrono::{TimeDelta, TimeZone, Utc};

    fn rows() -> Vec<NormalizedRow> {
        let base = Utc.with_ymd_and_hms(2025, 8, 10, 0, 0, 0).unwrap();
        let mut rows = Vec::new();
        for bucket in 0..3 {
            for metric in [Metric::WindSpeed, Metric::Power] {
                for stat in StatKind::ALL {
                    rows.push(NormalizedRow {
                        timestamp: base + TimeDelta::minutes(10 * bucket),
                        signal: Signal::new(metric, stat),
                        value: bucket as f64,
                    });
                }
            }
        }
        rows
    }

    #[test]
    fn test_all_resolved() {
        let registry = SignalRegistry::from_pairs(
            Signal::all_for(&[Metric::WindSpeed, Metric::Power])
                .into_iter()
                .enumerate()
                .map(|(i, s)| (s.name(), i as u32 + 1)),
        );

        let resolution = resolve(&rows(), &registry);
        assert_eq!(resolution.records.len(), 24);
        assert!(resolution.unresolved.is_empty());
        assert_eq!(resolution.records[0].signal_id, 1);
        assert_eq!(resolution.records[7].signal_id, 8);
    }

    #[test]
    fn test_unknown_names_dropped_and_reported_once() {
        let registry = SignalRegistry::from_pairs([
            ("wind_speed_mean", 1),
            ("wind_speed_min", 2),
            ("wind_speed_max", 3),
            ("wind_speed_stddev", 4),
        ]);

        let resolution = resolve(&rows(), &registry);
        assert_eq!(resolution.records.len(), 12);
        assert_eq!(
            resolution.unresolved,
            vec!["power_max", "power_mean", "power_min", "power_stddev"]
        );
    }

    #[test]
    fn test_empty_registry_resolves_nothing() {
        let resolution = resolve(&rows(), &SignalRegistry::default());
        assert!(resolution.records.is_empty());
        assert_eq!(resolution.unresolved.len(), 8);
    }

    #[test]
    fn test_resolved_and_unresolved_cover_all_names() {
        let registry = SignalRegistry::from_pairs([("power_mean", 10), ("wind_speed_max", 11)]);
        let input = rows();
        let resolution = resolve(&input, &registry);

        let input_names: HashSet<&str> = input.iter().map(|r| r.signal_name()).collect();
        let resolved_names: HashSet<u32> =
            resolution.records.iter().map(|r| r.signal_id).collect();

        assert_eq!(
            resolved_names.len() + resolution.unresolved.len(),
            input_names.len()
        );
    }

    #[test]
    fn test_values_and_timestamps_preserved() {
        let registry = SignalRegistry::from_pairs([("power_mean", 5)]);
        let input = rows();
        let resolution = resolve(&input, &registry);

        let expected: Vec<_> = input
            .iter()
            .filter(|r| r.signal_name() == "power_mean")
            .map(|r| (r.timestamp, r.value))
            .collect();
        let actual: Vec<_> = resolution
            .records
            .iter()
            .map(|r| (r.timestamp, r.value))
            .collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_empty_input() {
        let resolution = resolve(&[], &SignalRegistry::default());
        assert_eq!(resolution, Resolution::default());
    }
}
