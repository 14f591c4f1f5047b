//! Background expiry sweeper.
//!
//! One sweeper runs per generation on its own periodic task. Each tick it
//! asks the engine for a single sweep pass; the engine snapshots the
//! reservation table first and performs cancellations afterwards, so no
//! structural lock is ever held across a registry call. The task exits at
//! the next tick boundary after the generation signals shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::SaleEngine;

/// Handle to a generation's sweeper task.
#[derive(Debug)]
pub struct ExpirySweeper {
    handle: JoinHandle<()>,
}

impl ExpirySweeper {
    /// Spawns the sweeper loop for `engine`, ticking every `interval`.
    ///
    /// The loop observes `shutdown` cooperatively: the receiver resolving
    /// (or its sender dropping) stops the task at the next safe point.
    #[must_use]
    pub fn spawn(
        engine: Arc<SaleEngine>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.sweep();
                    }
                    changed = shutdown.changed() => {
                        // A send of `true` or a dropped sender both mean the
                        // generation is going away.
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(window_id = engine.window_id(), "expiry sweeper stopped");
        });
        Self { handle }
    }

    /// Aborts the task without waiting for the next tick. Used when a
    /// drain deadline has already passed.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Whether the task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
