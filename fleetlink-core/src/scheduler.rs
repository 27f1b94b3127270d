//! Recurring and one-shot background tasks
//!
//! Every periodic behavior of the front-end and of the worker runs through a
//! [`Scheduler`]. A tick that fails, either by returning an error or by
//! panicking, is logged and the task keeps its schedule.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Shared background scheduler
///
/// Cloning is cheap; every clone spawns into the same cancellation scope, so
/// [`Scheduler::shutdown`] on any clone stops all tasks.
#[derive(Clone, Default)]
pub struct Scheduler {
    root: CancellationToken,
}

/// Handle to a scheduled task
///
/// Dropping the handle leaves the task running; call [`TaskHandle::cancel`].
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Stop the task. No tick starts after this returns, and a tick that is
    /// currently running is dropped at its next await point.
    pub fn cancel(&self) {
        self.token.cancel();
        self.join.abort();
        debug!(task = self.name, "Scheduled task cancelled");
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` every `period`, starting one period from now.
    pub fn schedule_recurring<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        task: F,
    ) -> TaskHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let token = self.root.child_token();
        let cancel = token.clone();
        // interval panics on a zero period
        let period = period.max(Duration::from_millis(1));

        let join = tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    _ = timer.tick() => {}
                }

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    () = run_tick(name, task()) => {}
                }
            }
        });

        debug!(task = name, period = ?period, "Recurring task scheduled");
        TaskHandle { name, token, join }
    }

    /// Run `task` once after `delay`.
    pub fn schedule_once<F, Fut>(&self, name: &'static str, delay: Duration, task: F) -> TaskHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let token = self.root.child_token();
        let cancel = token.clone();

        let join = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = run_tick(name, task()) => {}
            }
        });

        TaskHandle { name, token, join }
    }

    /// Cancel every task spawned from this scheduler (and its clones).
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }
}

/// Run one tick, containing both errors and panics.
async fn run_tick<Fut>(name: &'static str, tick: Fut)
where
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    match AssertUnwindSafe(tick).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(task = name, error = %e, "Scheduled task tick failed");
        }
        Err(panic_payload) => {
            let info = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            error!(task = name, panic = %info, "Scheduled task tick panicked");
        }
    }
}
