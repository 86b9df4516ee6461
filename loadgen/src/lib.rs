//! The loadgen remote write load generation and verification tool.
//!
//! This library supports the loadgen binary found elsewhere in this project.
//! Each simulated tenant owns a write client that pushes deterministic series
//! into a Prometheus remote write endpoint and, optionally, a query client
//! that reads those series back through the range query API and checks them
//! sample by sample.

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
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod counters;
pub mod identity;
pub mod orchestrator;
pub mod proxy;
pub mod query;
pub mod transport;
pub mod verify;
pub mod write;

/// Milliseconds since the unix epoch, per the system clock.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, loadgen_series::duration_millis)
}

/// Run `tick` every `interval` until `shutdown` is cancelled.
///
/// The first tick fires immediately and `tick` receives the current time in
/// milliseconds since the epoch. A tick that comes due while the previous one
/// is still running is skipped, not queued. Shutdown is only observed between
/// ticks.
pub(crate) async fn run_ticks<F, Fut>(interval: Duration, shutdown: CancellationToken, mut tick: F)
where
    F: FnMut(i64) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => return,
            _ = ticker.tick() => tick(now_millis()).await,
        }
    }
}
