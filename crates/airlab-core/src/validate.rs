//! Physical plausibility checks.
//!
//! One out-of-range metric rejects the whole reading. Each offending metric
//! is still reported individually for diagnostics.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::metric::{CanonicalMetric, ValidityRange};
use crate::reading::Reading;

/// One metric outside its plausibility bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeViolation {
    pub metric: CanonicalMetric,
    pub value: f64,
    pub expected: ValidityRange,
}

impl fmt::Display for RangeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={} (expected {})",
            self.metric, self.value, self.expected
        )
    }
}

/// Every violation found in a reading. Empty means the reading passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub violations: Vec<RangeViolation>,
}

impl ValidationReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.violations.is_empty() {
            return f.write_str("all metrics within range");
        }
        for (idx, violation) in self.violations.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

/// Check every present metric against its range. Absent metrics are skipped.
#[must_use]
pub fn check_reading(reading: &Reading) -> ValidationReport {
    let violations = reading
        .iter()
        .filter_map(|(metric, value)| {
            let expected = metric.validity_range();
            (!expected.contains(value)).then_some(RangeViolation {
                metric,
                value,
                expected,
            })
        })
        .collect();
    ValidationReport { violations }
}

/// Gate a reading for persistence, logging each violation.
pub fn validate_reading(reading: &Reading) -> Result<(), ValidationReport> {
    let report = check_reading(reading);
    if report.passed() {
        return Ok(());
    }
    for violation in &report.violations {
        warn!(
            metric = %violation.metric,
            value = violation.value,
            min = violation.expected.min,
            max = violation.expected.max,
            "Validation failed: {violation}"
        );
    }
    Err(report)
}
