//! Generation lifecycle: one engine per sale window, rotated without
//! downtime.
//!
//! The [`GenerationManager`] owns the live generation behind an `ArcSwap`;
//! request handlers load it lock-free. On the window boundary a new
//! generation is built, recovered from the durable store, and swapped in
//! atomically; the outgoing one drains. If building or recovering the new
//! generation fails, the old one simply keeps serving.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use flashsale_core::{Clock, DurableStore, SaleConfig, SaleError};

use super::sweeper::ExpirySweeper;
use super::{EngineStats, SaleEngine};

/// Admission gate for one generation.
///
/// Tracks in-flight requests with RAII guards so a drain can wait for them,
/// and rejects new requests once draining starts. The double check in
/// [`try_begin`](Self::try_begin) closes the race where a drain begins
/// between the first load and the increment.
#[derive(Debug, Default)]
pub struct GenerationGate {
    draining: AtomicBool,
    in_flight: AtomicU64,
}

impl GenerationGate {
    /// Admits a request, returning a guard that must live for the
    /// request's duration.
    ///
    /// # Errors
    ///
    /// Returns `Draining` once the generation stopped accepting requests.
    pub fn try_begin(self: &Arc<Self>) -> Result<RequestGuard, SaleError> {
        if self.draining.load(Ordering::Acquire) {
            return Err(SaleError::Draining);
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if self.draining.load(Ordering::Acquire) {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(SaleError::Draining);
        }
        Ok(RequestGuard {
            gate: Arc::clone(self),
        })
    }

    /// Stops admitting new requests.
    pub fn start_drain(&self) {
        self.draining.store(true, Ordering::Release);
    }

    /// Whether the gate has started draining.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Requests currently inside the gate.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Waits for in-flight requests to finish, up to `grace`.
    ///
    /// Returns `true` when the gate emptied in time.
    pub async fn wait_for_drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            // Poll at 10ms intervals to avoid busy-waiting.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// RAII guard for one admitted request.
///
/// Decrements the in-flight counter on drop, even if the handler panics.
#[derive(Debug)]
pub struct RequestGuard {
    gate: Arc<GenerationGate>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A live engine bound to one sale window, plus its gate and sweeper.
pub struct Generation {
    engine: Arc<SaleEngine>,
    gate: Arc<GenerationGate>,
    sweeper: ExpirySweeper,
    shutdown_tx: watch::Sender<bool>,
}

impl Generation {
    /// Builds, seeds, and recovers a generation for `window_id`, then
    /// starts its sweeper and opens the gate.
    ///
    /// # Errors
    ///
    /// Any failure (config validation, window seeding, recovery reads)
    /// discards the generation; the caller keeps serving from the previous
    /// one.
    pub async fn start(
        config: SaleConfig,
        window_id: i64,
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Arc<Self>> {
        let engine = SaleEngine::new(config.clone(), window_id, Arc::clone(&store), clock)?;

        #[allow(clippy::cast_possible_wrap)]
        store
            .seed_window(window_id, config.items_per_window as i64)
            .await?;
        engine.recover().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = ExpirySweeper::spawn(Arc::clone(&engine), config.sweep_interval, shutdown_rx);

        Ok(Arc::new(Self {
            engine,
            gate: Arc::new(GenerationGate::default()),
            sweeper,
            shutdown_tx,
        }))
    }

    /// The generation's engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<SaleEngine> {
        &self.engine
    }

    /// Admission gate for request handlers.
    ///
    /// # Errors
    ///
    /// Returns `Draining` once the generation stopped accepting requests.
    pub fn begin_request(&self) -> Result<RequestGuard, SaleError> {
        self.gate.try_begin()
    }

    /// Whether this generation still accepts requests.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        !self.gate.is_draining()
    }

    /// Drains the generation: reject new requests, give in-flight ones up
    /// to `grace`, then stop the sweeper.
    pub async fn drain(&self, grace: Duration) {
        self.gate.start_drain();
        let drained = self.gate.wait_for_drain(grace).await;
        if drained {
            info!(window_id = self.engine.window_id(), "generation drained cleanly");
        } else {
            warn!(
                window_id = self.engine.window_id(),
                in_flight = self.gate.in_flight(),
                "drain grace expired with requests in flight"
            );
        }
        let _ = self.shutdown_tx.send(true);
        if !drained {
            // Past the grace there is nothing left to preserve.
            self.sweeper.abort();
        }
        metrics::counter!("flashsale_generations_drained_total").increment(1);
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("window_id", &self.engine.window_id())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

/// Owns the live generation and rotates it on window boundaries.
pub struct GenerationManager {
    config: SaleConfig,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    current: ArcSwap<Generation>,
}

impl GenerationManager {
    /// Starts the first generation for the window containing "now" and
    /// wraps it in a manager.
    ///
    /// # Errors
    ///
    /// Bootstrap failure is fatal: there is no previous generation to fall
    /// back to.
    pub async fn bootstrap(
        config: SaleConfig,
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Arc<Self>> {
        let window_id = config.window_id_at(clock.now_millis());
        let generation = Generation::start(
            config.clone(),
            window_id,
            Arc::clone(&store),
            Arc::clone(&clock),
        )
        .await?;
        info!(window_id, "initial generation started");
        Ok(Arc::new(Self {
            config,
            store,
            clock,
            current: ArcSwap::from(generation),
        }))
    }

    /// The currently serving generation.
    #[must_use]
    pub fn current(&self) -> Arc<Generation> {
        self.current.load_full()
    }

    /// Stats of the current engine, for health reporting.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.current().engine().stats()
    }

    /// In-flight requests in the current generation.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.current().gate.in_flight()
    }

    /// Reserves an item through the current generation.
    ///
    /// The engine call runs on its own task: a caller that disconnects
    /// mid-request cannot abandon the two-phase protocol between its
    /// commit points. The in-flight guard lives inside that task, so
    /// drains wait for the operation, not the caller.
    ///
    /// # Errors
    ///
    /// `Draining` while a rotation is handing off; otherwise whatever the
    /// engine returns.
    pub async fn reserve(&self, user_id: i64, item_id: i64) -> Result<Uuid, SaleError> {
        let generation = self.current();
        let guard = generation.begin_request()?;
        let task = tokio::spawn(async move {
            let result = generation.engine().reserve(user_id, item_id).await;
            drop(guard);
            result
        });
        match task.await {
            Ok(result) => result,
            Err(err) => Err(SaleError::Internal(anyhow::anyhow!(
                "reserve task failed: {err}"
            ))),
        }
    }

    /// Confirms a purchase through the current generation.
    ///
    /// Detached-task discipline as in [`reserve`](Self::reserve): the
    /// protocol always reaches a commit or a full rollback even if the
    /// caller goes away.
    ///
    /// # Errors
    ///
    /// `Draining` while a rotation is handing off; otherwise whatever the
    /// engine returns.
    pub async fn purchase(&self, code: Uuid) -> Result<(), SaleError> {
        let generation = self.current();
        let guard = generation.begin_request()?;
        let task = tokio::spawn(async move {
            let result = generation.engine().purchase(code).await;
            drop(guard);
            result
        });
        match task.await {
            Ok(result) => result,
            Err(err) => Err(SaleError::Internal(anyhow::anyhow!(
                "purchase task failed: {err}"
            ))),
        }
    }

    /// Rotates to the window containing "now".
    ///
    /// Building and recovering the next generation happens while the old
    /// one is still serving; only a successful build swaps the pointer and
    /// drains the predecessor.
    ///
    /// # Errors
    ///
    /// Returns the build/recovery error after logging; the previous
    /// generation keeps serving.
    pub async fn rotate(&self) -> anyhow::Result<()> {
        let window_id = self.config.window_id_at(self.clock.now_millis());
        let next = match Generation::start(
            self.config.clone(),
            window_id,
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
        )
        .await
        {
            Ok(generation) => generation,
            Err(err) => {
                error!(window_id, error = %err, "new generation failed to start, keeping previous");
                return Err(err);
            }
        };

        let previous = self.current.swap(next);
        info!(
            old_window = previous.engine().window_id(),
            new_window = window_id,
            "generation rotated"
        );
        previous.drain(self.config.drain_grace).await;
        Ok(())
    }

    /// Runs the rotation timer until `shutdown` fires.
    ///
    /// Sleeps to each window boundary, rotates, repeats. A failed rotation
    /// retries at the next boundary; the previous generation serves in the
    /// meantime.
    #[must_use]
    pub fn spawn_rotation_timer(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let now = manager.clock.now_millis();
                let boundary = manager
                    .config
                    .window_start(manager.config.window_id_at(now) + 1);
                #[allow(clippy::cast_sign_loss)]
                let wait = Duration::from_millis((boundary - now).max(1) as u64);

                tokio::select! {
                    () = tokio::time::sleep(wait) => {
                        if let Err(err) = manager.rotate().await {
                            error!(error = %err, "window rotation failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("rotation timer stopped");
        })
    }

    /// Drains the current generation for process shutdown.
    pub async fn shutdown(&self) {
        self.current().drain(self.config.drain_grace).await;
        if let Err(err) = self.store.hard_flush().await {
            warn!(error = %err, "store flush on shutdown failed");
        }
    }
}

impl std::fmt::Debug for GenerationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationManager")
            .field("current", &self.current())
            .finish()
    }
}
