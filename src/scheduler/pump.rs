//! Tokio-driven scheduler pump.
//!
//! Calls [`Scheduler::run_once`] at a steady cadence on a background task.
//! Any period no longer than the shortest retry interval in use is correct.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::Scheduler;
use crate::core::DEFAULT_PUMP_PERIOD;

/// Shortest period the pump accepts.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Handle to a running pump task.
#[derive(Debug)]
pub struct PumpHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PumpHandle {
    /// Stop the pump and wait for the task to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }

    /// Whether the pump task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Spawn a pump ticking `scheduler` every `period` on the current runtime.
///
/// Must be called from within a tokio runtime. Callbacks run on the pump
/// task, so blocking transfer calls must not be made from them.
pub fn spawn(scheduler: Arc<Scheduler>, period: Duration) -> PumpHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let period = period.max(MIN_PERIOD);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(?period, "scheduler pump started");

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {
                    scheduler.run_once();
                }
            }
        }

        debug!("scheduler pump stopped");
    });

    PumpHandle {
        shutdown_tx: Some(shutdown_tx),
        task,
    }
}

/// Spawn a pump ticking every [`DEFAULT_PUMP_PERIOD`].
pub fn spawn_default(scheduler: Arc<Scheduler>) -> PumpHandle {
    spawn(scheduler, DEFAULT_PUMP_PERIOD)
}
