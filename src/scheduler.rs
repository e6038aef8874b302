//! Auto-update scheduler
//!
//! A spawned task ticks at a fixed period and runs one job per tick. Missed
//! ticks are skipped rather than bunched up. Stopping only prevents new ticks:
//! a job that is already running finishes, and [`AutoUpdate::stop`] waits for
//! it.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Handle to a running repeating task.
///
/// Dropping the handle stops scheduling as well, without waiting.
#[derive(Debug)]
pub struct AutoUpdate {
    period: Duration,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl AutoUpdate {
    /// Run `job` every `period`, starting with an immediate first tick.
    ///
    /// The loop ends on [`stop`](Self::stop) or when `job` resolves to `false`.
    pub fn spawn<F, Fut>(period: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Auto-update started, period {:?}", period);

            loop {
                tokio::select! {
                    biased;
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = interval.tick() => {}
                }

                // Runs outside the select so a stop request cannot cut it short.
                if !job().await {
                    debug!("Auto-update job asked to stop");
                    break;
                }
            }

            info!("Auto-update stopped");
        });

        Self {
            period,
            stop_tx,
            task: Some(task),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop ticking and wait for a job in flight to complete.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Auto-update task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for AutoUpdate {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}
