//! Signal identity: the closed metric × statistic enumeration and the
//! name → id registry snapshot loaded from the target store.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Source metrics the pipeline is allowed to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Metric {
    #[serde(rename = "wind_speed")]
    WindSpeed,
    #[serde(rename = "power")]
    Power,
    /// Spelled the way the source API exposes the column.
    #[serde(rename = "ambient_temprature")]
    AmbientTemperature,
}

impl Metric {
    /// Every allow-listed metric, in declaration order.
    pub const ALL: [Metric; 3] = [Metric::WindSpeed, Metric::Power, Metric::AmbientTemperature];

    /// Returns the source column name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WindSpeed => "wind_speed",
            Self::Power => "power",
            Self::AmbientTemperature => "ambient_temprature",
        }
    }

    /// Parses a source column name. Returns `None` for names outside the allow-list.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.as_str() == name)
    }

    /// Human-readable label used in signal descriptions.
    pub fn label(self) -> &'static str {
        match self {
            Self::WindSpeed => "wind speed",
            Self::Power => "power output",
            Self::AmbientTemperature => "ambient temperature",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-bucket summary statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    Mean,
    Min,
    Max,
    Stddev,
}

impl StatKind {
    pub const ALL: [StatKind; 4] = [StatKind::Mean, StatKind::Min, StatKind::Max, StatKind::Stddev];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Min => "min",
            Self::Max => "max",
            Self::Stddev => "stddev",
        }
    }
}

/// A derived signal: one statistic of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signal {
    pub metric: Metric,
    pub stat: StatKind,
}

impl Signal {
    pub const fn new(metric: Metric, stat: StatKind) -> Self {
        Self { metric, stat }
    }

    /// Returns the stable signal name (`{metric}_{stat}`).
    pub fn name(self) -> &'static str {
        use Metric::*;
        use StatKind::*;

        match (self.metric, self.stat) {
            (WindSpeed, Mean) => "wind_speed_mean",
            (WindSpeed, Min) => "wind_speed_min",
            (WindSpeed, Max) => "wind_speed_max",
            (WindSpeed, Stddev) => "wind_speed_stddev",
            (Power, Mean) => "power_mean",
            (Power, Min) => "power_min",
            (Power, Max) => "power_max",
            (Power, Stddev) => "power_stddev",
            (AmbientTemperature, Mean) => "ambient_temprature_mean",
            (AmbientTemperature, Min) => "ambient_temprature_min",
            (AmbientTemperature, Max) => "ambient_temprature_max",
            (AmbientTemperature, Stddev) => "ambient_temprature_stddev",
        }
    }

    /// Description written to the signal table when the registry is seeded.
    pub fn description(self, bucket_minutes: u64) -> String {
        let what = match self.stat {
            StatKind::Mean => "Mean",
            StatKind::Min => "Minimum",
            StatKind::Max => "Maximum",
            StatKind::Stddev => "Sample standard deviation",
        };
        format!(
            "{what} of {} over {bucket_minutes}-minute intervals",
            self.metric.label()
        )
    }

    /// Enumerates every signal derived from the given metric set.
    pub fn all_for(metrics: &[Metric]) -> Vec<Signal> {
        metrics
            .iter()
            .flat_map(|&metric| StatKind::ALL.iter().map(move |&stat| Signal::new(metric, stat)))
            .collect()
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable snapshot of the target store's signal name → id mapping.
///
/// Names are kept as plain strings: the registry is provisioned outside the
/// pipeline and may contain names this build does not know about.
#[derive(Debug, Clone, Default)]
pub struct SignalRegistry {
    ids: HashMap<String, u32>,
}

impl SignalRegistry {
    /// Builds a registry from (name, id) pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Self {
            ids: pairs.into_iter().map(|(name, id)| (name.into(), id)).collect(),
        }
    }

    /// Looks up the surrogate id for a signal name.
    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
