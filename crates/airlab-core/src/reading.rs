//! Canonical readings: at most one value per metric.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::metric::CanonicalMetric;

/// Mapping from canonical metric to value.
///
/// Partial readings are normal; merging is last-write-wins per metric.
/// Iteration follows [`CanonicalMetric`] order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reading {
    values: BTreeMap<CanonicalMetric, f64>,
}

impl Reading {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a metric, returning the value it replaced.
    pub fn insert(&mut self, metric: CanonicalMetric, value: f64) -> Option<f64> {
        self.values.insert(metric, value)
    }

    #[must_use]
    pub fn get(&self, metric: CanonicalMetric) -> Option<f64> {
        self.values.get(&metric).copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CanonicalMetric, f64)> + '_ {
        self.values.iter().map(|(metric, value)| (*metric, *value))
    }

    /// Overlay `other` on top of this reading.
    pub fn merge(&mut self, other: &Self) {
        for (metric, value) in other.iter() {
            self.values.insert(metric, value);
        }
    }
}

impl FromIterator<(CanonicalMetric, f64)> for Reading {
    fn from_iter<I: IntoIterator<Item = (CanonicalMetric, f64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (metric, value) in self.iter() {
            if !first {
                f.write_str("  ")?;
            }
            write!(f, "{metric}={value:?}")?;
            first = false;
        }
        Ok(())
    }
}
