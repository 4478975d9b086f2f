//! Stale-job watchdog.
//!
//! Workers that die mid-job leave their jobs in the active set with an aging
//! heartbeat score. The watchdog sweeps that set periodically and fails
//! anything past the staleness threshold, so subscribers get their terminal
//! event instead of hanging until the blocking-path timeout.

use std::time::Duration;

use tokio::sync::watch;

use crate::queue::TaskQueue;

pub struct Watchdog {
    queue: TaskQueue,
    interval: Duration,
}

impl Watchdog {
    pub fn new(queue: TaskQueue) -> Self {
        let interval = queue.config().watchdog_interval;
        Self { queue, interval }
    }

    /// Sweep until the shutdown flag flips. Multiple instances may run
    /// concurrently; the status write guard keeps the sweep idempotent.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if self.interval.is_zero() || self.queue.config().stale_after.is_zero() {
            tracing::info!("watchdog disabled by configuration");
            return;
        }
        tracing::info!(
            interval_secs = self.interval.as_secs_f64(),
            stale_after_secs = self.queue.config().stale_after.as_secs_f64(),
            "watchdog started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.queue.fail_stale_jobs().await {
                        Ok(failed) if !failed.is_empty() => {
                            tracing::warn!(jobs = ?failed, "watchdog failed stale jobs");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(error = %err, "watchdog sweep failed; will retry");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("watchdog stopped");
    }
}
