//! The loadgen series
//!
//! This library produces the synthetic series that loadgen writes into a
//! remote write endpoint. Every value here is a pure function of wall-clock
//! time and configuration, so the read path can recompute what the write path
//! sent without sharing any state with it.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::time::Duration;

pub mod prompb;
mod waveform;

pub use prompb::{Label, Sample, TimeSeries, WriteRequest};
pub use waveform::{PERIOD, Waveform, sawtooth, sine};

/// Name of the label carrying the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";
/// Name of the label carrying the 1-based series index.
pub const WAVE_LABEL: &str = "wave";
/// Name of the label that changes once per churn period.
pub const CHURN_LABEL: &str = "churn";

pub(crate) const NANOS_PER_MILLI: i64 = 1_000_000;
const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// How many series to produce and how they are labelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    /// Number of series per waveform.
    pub series: usize,
    /// Number of `extraLabel<N>="default"` labels added to every series.
    pub extra_labels: usize,
    /// Period over which every series gradually churns. Zero disables churn.
    pub churn_period: Duration,
}

/// Convert `duration` to whole milliseconds, saturating.
#[must_use]
pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Align `timestamp` down to the closest multiple of `interval`.
///
/// Both are in milliseconds. The result `r` satisfies `r <= timestamp < r +
/// interval` and `r mod interval == 0`. A zero interval returns `timestamp`
/// unchanged.
#[must_use]
pub fn align_to_interval(timestamp: i64, interval: Duration) -> i64 {
    let interval = duration_millis(interval);
    if interval == 0 {
        return timestamp;
    }
    timestamp - timestamp.rem_euclid(interval)
}

/// Compute the churn id of the series at 1-based `index` out of `series` at
/// `timestamp`.
///
/// The id advances once per `period`. Each series is shifted by
/// `period / series * index` so that the whole set relabels gradually across
/// the period rather than all at once. Returns `None` when churn is disabled.
#[must_use]
pub fn churn_id(timestamp: i64, index: usize, series: usize, period: Duration) -> Option<i64> {
    if period.is_zero() || series == 0 {
        return None;
    }
    let period_nanos = i64::try_from(period.as_nanos()).unwrap_or(i64::MAX);
    let series = i64::try_from(series).unwrap_or(i64::MAX);
    let index = i64::try_from(index).unwrap_or(i64::MAX);

    let shift = (period_nanos / series).saturating_mul(index);
    let seconds = timestamp
        .saturating_mul(NANOS_PER_MILLI)
        .saturating_add(shift)
        .div_euclid(NANOS_PER_SECOND);
    let period_seconds = i64::try_from(period.as_secs()).unwrap_or(i64::MAX).max(1);
    Some(seconds.div_euclid(period_seconds))
}

/// Generate the series of `waveform` at `timestamp`, milliseconds since the
/// epoch.
///
/// Every series carries exactly one sample. Labels of each series are sorted
/// by name, then value.
#[must_use]
pub fn generate(waveform: Waveform, timestamp: i64, shape: &Shape) -> Vec<TimeSeries> {
    let value = waveform.value(timestamp);
    let extra_labels: Vec<Label> = (0..shape.extra_labels)
        .map(|j| Label::new(format!("extraLabel{j}"), "default"))
        .collect();

    (1..=shape.series)
        .map(|index| {
            let mut labels = Vec::with_capacity(3 + shape.extra_labels);
            labels.push(Label::new(METRIC_NAME_LABEL, waveform.metric_name()));
            labels.push(Label::new(WAVE_LABEL, index.to_string()));
            labels.extend(extra_labels.iter().cloned());
            if let Some(churn) = churn_id(timestamp, index, shape.series, shape.churn_period) {
                labels.push(Label::new(CHURN_LABEL, churn.to_string()));
            }
            labels.sort_unstable_by(|a, b| a.name.cmp(&b.name).then_with(|| a.value.cmp(&b.value)));

            TimeSeries {
                labels,
                samples: vec![Sample { value, timestamp }],
            }
        })
        .collect()
}

/// Generate the series of every waveform in `waveforms`, concatenated in
/// order.
#[must_use]
pub fn generate_all(waveforms: &[Waveform], timestamp: i64, shape: &Shape) -> Vec<TimeSeries> {
    let mut series = Vec::with_capacity(waveforms.len() * shape.series);
    for waveform in waveforms {
        series.extend(generate(*waveform, timestamp, shape));
    }
    series
}
