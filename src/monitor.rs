//! The polling loop behind the `monitor` command.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::engine::{CycleError, SyncEngine};
use crate::transfer::format_duration;

/// Run `cycle` every `interval` until `shutdown` fires.
///
/// The interval is measured from the start of the previous cycle, so a cycle
/// that overruns it is followed immediately by the next. Errors and panics in
/// a cycle are logged and the loop carries on. Returns the number of cycles
/// started.
pub async fn run_loop<F, Fut, T, E>(
    interval: Duration,
    shutdown: &CancellationToken,
    mut cycle: F,
) -> u64
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut cycles = 0u64;
    loop {
        if shutdown.is_cancelled() {
            tracing::info!("Shutdown requested, exiting...");
            break;
        }

        let started = Instant::now();
        cycles += 1;
        tracing::debug!(cycle = cycles, "Starting cycle");

        match AssertUnwindSafe(cycle()).catch_unwind().await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(cycle = cycles, "Cycle failed: {}", e),
            Err(_) => tracing::error!(cycle = cycles, "Cycle panicked"),
        }

        if shutdown.is_cancelled() {
            tracing::info!("Shutdown requested, exiting...");
            break;
        }

        let next = started + interval;
        let now = Instant::now();
        if next <= now {
            tracing::debug!("Cycle overran the polling interval, starting the next one now");
            continue;
        }
        tracing::info!("Waiting {}...", format_duration(next - now));
        tokio::select! {
            _ = tokio::time::sleep_until(next) => {}
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown during wait, exiting...");
                break;
            }
        }
    }
    cycles
}

/// Drive `engine` forever on its configured polling interval.
pub async fn run_forever(engine: &SyncEngine, shutdown: &CancellationToken) -> u64 {
    let interval = engine.settings().polling_interval;
    run_loop(interval, shutdown, move || async move {
        let report = engine.run_cycle(shutdown).await?;
        tracing::info!(
            listed = report.listed,
            pending = report.pending,
            completed = report.batch.completed,
            already_present = report.batch.already_present,
            failed = report.batch.failed.len(),
            "Cycle complete"
        );
        Ok::<_, CycleError>(report)
    })
    .await
}
