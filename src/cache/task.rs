//! Timer-driven background loops with explicit shutdown.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// A periodic task (store sweeper, stats monitor, rule scheduler).
///
/// `stop().await` signals the loop and waits for it to finish. Dropping the
/// handle without stopping aborts the task so no timer outlives its owner.
pub struct BackgroundTask {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawn `tick` every `period`. The first tick fires one period after spawn.
    ///
    /// The loop ends when `tick` returns `ControlFlow::Break`, e.g. once the
    /// component it serves has been dropped.
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let name = name.into();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await; // Skip the first immediate tick

            debug!(task = %task_name, period_ms = period.as_millis() as u64, "Background task started");
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if tick().await.is_break() {
                            debug!(task = %task_name, "Background task target gone");
                            break;
                        }
                    }
                }
            }
            debug!(task = %task_name, "Background task finished");
        });

        Self {
            name,
            shutdown_tx,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Signal shutdown and wait for the loop to exit.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(task = %self.name, error = %err, "Background task ended abnormally");
                }
            }
        }
        info!(task = %self.name, "Background task stopped");
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
