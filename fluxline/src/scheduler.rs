//! Periodic flush timer with jitter.
//!
//! Each period is `flush_interval` plus a fresh uniform sample from
//! `[0, jitter_interval]`, so many clients started together spread their
//! writes instead of hitting the server in lockstep.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::accumulator::Accumulator;

/// Returns the length of the next timer period.
pub(crate) fn next_period(flush_interval: Duration, jitter_interval: Duration) -> Duration {
    if jitter_interval.is_zero() {
        return flush_interval;
    }

    let bound = u64::try_from(jitter_interval.as_nanos()).unwrap_or(u64::MAX);
    let jitter = Duration::from_nanos(rand::rng().random_range(0..=bound));
    flush_interval.saturating_add(jitter)
}

/// Resolves once `shutdown` turns `true` or its sender is dropped.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Starts the timer task. It flushes every pending target each period and
/// stops once `shutdown` turns `true` or its sender is dropped.
pub(crate) fn spawn(
    handle: &Handle,
    accumulator: Arc<Accumulator>,
    flush_interval: Duration,
    jitter_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    handle.spawn(async move {
        loop {
            let period = next_period(flush_interval, jitter_interval);

            tokio::select! {
                () = tokio::time::sleep(period) => {
                    let batches = accumulator.flush_all();
                    if batches > 0 {
                        tracing::debug!(batches, ?period, "flush timer fired");
                    }
                }
                () = stopped(&mut shutdown) => break,
            }
        }

        tracing::debug!("flush timer stopped");
    })
}
