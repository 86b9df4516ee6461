//! Waveforms and their value functions.

use std::{f64::consts::PI, time::Duration};

use serde::Deserialize;

use crate::NANOS_PER_MILLI;

/// Period shared by every waveform: forty 15 second scrape intervals.
pub const PERIOD: Duration = Duration::from_secs(40 * 15);

#[allow(clippy::cast_possible_truncation)]
const PERIOD_NANOS: i64 = PERIOD.as_nanos() as i64;

/// The shape of the values written for a family of series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Waveform {
    /// `sin(2π t / PERIOD)`, in `[-1, 1]`
    Sine,
    /// `(t mod PERIOD) / PERIOD`, a ramp in `[0, 1)`
    Sawtooth,
}

impl Waveform {
    /// The `__name__` of every series of this waveform.
    #[must_use]
    pub const fn metric_name(self) -> &'static str {
        match self {
            Waveform::Sine => "cortex_load_generator_sine_wave",
            Waveform::Sawtooth => "cortex_load_generator_sawtooth_wave",
        }
    }

    /// The value of this waveform at `timestamp`, milliseconds since the
    /// epoch.
    #[must_use]
    pub fn value(self, timestamp: i64) -> f64 {
        match self {
            Waveform::Sine => sine(timestamp),
            Waveform::Sawtooth => sawtooth(timestamp),
        }
    }
}

/// Sine wave value at `timestamp`, milliseconds since the epoch.
///
/// The operation order is fixed: writers and verifiers both call this
/// function and compare results bit for bit.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn sine(timestamp: i64) -> f64 {
    let nanos = timestamp.wrapping_mul(NANOS_PER_MILLI) as f64;
    let radians = nanos / PERIOD_NANOS as f64 * 2.0 * PI;
    radians.sin()
}

/// Sawtooth value at `timestamp`, milliseconds since the epoch.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn sawtooth(timestamp: i64) -> f64 {
    let offset = timestamp.wrapping_mul(NANOS_PER_MILLI).rem_euclid(PERIOD_NANOS);
    offset as f64 / PERIOD_NANOS as f64
}
