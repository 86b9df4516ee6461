//! Sample-by-sample verification of read back series.
//!
//! The default query sums every sine series, so each returned sample must
//! equal `sine(timestamp) * series` and consecutive samples must be exactly
//! one step apart.

use std::time::Duration;

use loadgen_series::{Sample, duration_millis, sine};

/// Relative tolerance used when none is configured.
pub const DEFAULT_TOLERANCE: f64 = 0.001;

/// A single divergence between what the backend returned and what loadgen
/// wrote.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum Mismatch {
    /// A sample value differs from the expected value.
    #[error("sample at timestamp {timestamp} has value {actual}, expected {expected}")]
    Value {
        /// Timestamp of the sample, milliseconds
        timestamp: i64,
        /// Value returned by the backend
        actual: f64,
        /// Value recomputed locally
        expected: f64,
    },
    /// A sample is not exactly one step after its predecessor.
    #[error(
        "sample at timestamp {timestamp} was expected at timestamp {expected_timestamp}, one step after the previous sample at {previous_timestamp}"
    )]
    Gap {
        /// Timestamp of the sample, milliseconds
        timestamp: i64,
        /// Where the sample should have been, milliseconds
        expected_timestamp: i64,
        /// Timestamp of the preceding sample, milliseconds
        previous_timestamp: i64,
    },
}

/// Whether `actual` is within `tolerance` of `expected`, relative to
/// `|expected|`.
///
/// NaN never matches.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn values_match(actual: f64, expected: f64, tolerance: f64) -> bool {
    if actual == expected {
        return true;
    }
    (actual - expected).abs() <= tolerance * expected.abs()
}

/// Check `samples` against `expected_series` summed sine waves spaced `step`
/// apart.
///
/// Returns every mismatch found, in sample order. An empty result means the
/// samples verified.
#[must_use]
pub fn verify_sine_samples(
    samples: &[Sample],
    expected_series: usize,
    step: Duration,
    tolerance: f64,
) -> Vec<Mismatch> {
    let step = duration_millis(step);
    let series = expected_series as f64;
    // Summing `series` values on the backend may round differently than
    // multiplying here. Absorb that, and only that, around zero crossings.
    let rounding = f64::EPSILON * series;
    let mut mismatches = Vec::new();

    for (idx, sample) in samples.iter().enumerate() {
        let expected = sine(sample.timestamp) * series;
        let matched = values_match(sample.value, expected, tolerance)
            || (sample.value - expected).abs() <= rounding;
        if !matched {
            mismatches.push(Mismatch::Value {
                timestamp: sample.timestamp,
                actual: sample.value,
                expected,
            });
        }

        if idx > 0 {
            let previous_timestamp = samples[idx - 1].timestamp;
            let expected_timestamp = previous_timestamp.saturating_add(step);
            if sample.timestamp != expected_timestamp {
                mismatches.push(Mismatch::Gap {
                    timestamp: sample.timestamp,
                    expected_timestamp,
                    previous_timestamp,
                });
            }
        }
    }

    mismatches
}
