//! Canonical metric identifiers, field aliases and plausibility bounds.
//!
//! The metric set is closed: adding a metric means adding a variant, at least
//! one alias (its own name) and a [`ValidityRange`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// A recognized environmental measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalMetric {
    Co2Ppm,
    TemperatureC,
    HumidityPercent,
    PressureHpa,
    VocIndex,
    NoxIndex,
}

impl CanonicalMetric {
    /// Every metric, in storage column order.
    pub const ALL: [Self; 6] = [
        Self::Co2Ppm,
        Self::TemperatureC,
        Self::HumidityPercent,
        Self::PressureHpa,
        Self::VocIndex,
        Self::NoxIndex,
    ];

    /// Canonical name, also the storage column name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Co2Ppm => "co2_ppm",
            Self::TemperatureC => "temperature_c",
            Self::HumidityPercent => "humidity_percent",
            Self::PressureHpa => "pressure_hpa",
            Self::VocIndex => "voc_index",
            Self::NoxIndex => "nox_index",
        }
    }

    /// Inclusive plausibility bounds for this metric.
    #[must_use]
    pub const fn validity_range(self) -> ValidityRange {
        match self {
            Self::Co2Ppm => ValidityRange::new(150.0, 10_000.0),
            Self::TemperatureC => ValidityRange::new(-40.0, 85.0),
            Self::HumidityPercent => ValidityRange::new(0.0, 100.0),
            Self::PressureHpa => ValidityRange::new(300.0, 1200.0),
            Self::VocIndex | Self::NoxIndex => ValidityRange::new(0.0, 500.0),
        }
    }
}

impl fmt::Display for CanonicalMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalMetric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        canonicalize(s).ok_or_else(|| UnknownMetric(s.to_string()))
    }
}

/// Returned when a name is not in the alias table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown metric name: {0}")]
pub struct UnknownMetric(pub String);

/// Inclusive `[min, max]` bound on physically plausible values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidityRange {
    pub min: f64,
    pub max: f64,
}

impl ValidityRange {
    #[must_use]
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// NaN is never contained.
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}

impl fmt::Display for ValidityRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Raw field / topic-segment names (lower-case) and the metric they denote.
pub const FIELD_ALIASES: &[(&str, CanonicalMetric)] = &[
    ("co2", CanonicalMetric::Co2Ppm),
    ("carbon_dioxide", CanonicalMetric::Co2Ppm),
    ("co2_ppm", CanonicalMetric::Co2Ppm),
    ("temperature", CanonicalMetric::TemperatureC),
    ("temp", CanonicalMetric::TemperatureC),
    ("temperature_c", CanonicalMetric::TemperatureC),
    ("humidity", CanonicalMetric::HumidityPercent),
    ("rh", CanonicalMetric::HumidityPercent),
    ("relative_humidity", CanonicalMetric::HumidityPercent),
    ("humidity_percent", CanonicalMetric::HumidityPercent),
    ("pressure", CanonicalMetric::PressureHpa),
    ("pressure_hpa", CanonicalMetric::PressureHpa),
    ("voc", CanonicalMetric::VocIndex),
    ("voc_index", CanonicalMetric::VocIndex),
    ("nox", CanonicalMetric::NoxIndex),
    ("nox_index", CanonicalMetric::NoxIndex),
];

fn alias_table() -> &'static HashMap<&'static str, CanonicalMetric> {
    static TABLE: OnceLock<HashMap<&'static str, CanonicalMetric>> = OnceLock::new();
    TABLE.get_or_init(|| FIELD_ALIASES.iter().copied().collect())
}

/// Map a raw field or topic-segment name to its canonical metric.
///
/// Matching trims surrounding whitespace and ignores case. Unknown names
/// yield `None`; callers drop the associated data.
#[must_use]
pub fn canonicalize(raw: &str) -> Option<CanonicalMetric> {
    let key = raw.trim();
    if let Some(metric) = alias_table().get(key) {
        return Some(*metric);
    }
    alias_table().get(key.to_ascii_lowercase().as_str()).copied()
}
