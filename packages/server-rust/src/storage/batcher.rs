//! Size/interval batching adapter between the engine and a store backend.
//!
//! The engine awaits an acknowledgement for every append; this adapter
//! queues appends to per-kind flusher tasks and resolves each caller's
//! oneshot when its fact is durably written. Reservation facts flush as
//! atomic batches (one failure fails the whole batch's acks); purchase
//! facts are conditional per-row updates, so the flusher coalesces queue
//! wakeups but acks each row with its own outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use flashsale_core::store::{DurableStore, PurchaseFact, ReservationFact};
use flashsale_core::UnixMillis;

use super::StoreBackend;

/// Batching parameters.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum reservation facts per batch.
    pub reservation_batch: usize,
    /// Maximum time the first queued reservation waits for company.
    pub reservation_flush: Duration,
    /// Maximum purchase facts drained per cycle.
    pub purchase_batch: usize,
    /// Maximum time the first queued purchase waits.
    pub purchase_flush: Duration,
    /// Capacity of each append queue.
    pub queue_capacity: usize,
    /// How long `hard_flush` waits for the queues to empty.
    pub hard_flush_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            reservation_batch: 100,
            reservation_flush: Duration::from_millis(50),
            purchase_batch: 10,
            purchase_flush: Duration::from_millis(10),
            queue_capacity: 1024,
            hard_flush_timeout: Duration::from_secs(2),
        }
    }
}

struct Pending<T> {
    fact: T,
    ack: oneshot::Sender<anyhow::Result<()>>,
}

/// Collects up to `batch_size` items, waiting at most `flush_interval`
/// after `first` arrived.
async fn collect_batch<T>(
    rx: &mut mpsc::Receiver<Pending<T>>,
    first: Pending<T>,
    batch_size: usize,
    flush_interval: Duration,
) -> Vec<Pending<T>> {
    let mut batch = vec![first];
    let deadline = tokio::time::Instant::now() + flush_interval;
    while batch.len() < batch_size {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(item)) => batch.push(item),
            Ok(None) | Err(_) => break,
        }
    }
    batch
}

/// [`DurableStore`] adapter that batches appends onto a [`StoreBackend`].
///
/// Dropping the store closes the queues; the flusher tasks drain what they
/// hold and exit.
pub struct BatchingStore {
    backend: Arc<dyn StoreBackend>,
    reservation_tx: mpsc::Sender<Pending<ReservationFact>>,
    purchase_tx: mpsc::Sender<Pending<PurchaseFact>>,
    pending: Arc<AtomicU64>,
    hard_flush_timeout: Duration,
}

impl BatchingStore {
    /// Spawns the flusher tasks and returns the adapter.
    #[must_use]
    pub fn spawn(backend: Arc<dyn StoreBackend>, config: BatchConfig) -> Arc<Self> {
        let (reservation_tx, mut reservation_rx) =
            mpsc::channel::<Pending<ReservationFact>>(config.queue_capacity);
        let (purchase_tx, mut purchase_rx) =
            mpsc::channel::<Pending<PurchaseFact>>(config.queue_capacity);
        let pending = Arc::new(AtomicU64::new(0));

        {
            let backend = Arc::clone(&backend);
            let pending = Arc::clone(&pending);
            let batch_size = config.reservation_batch;
            let flush_interval = config.reservation_flush;
            tokio::spawn(async move {
                while let Some(first) = reservation_rx.recv().await {
                    let batch =
                        collect_batch(&mut reservation_rx, first, batch_size, flush_interval)
                            .await;
                    let facts: Vec<ReservationFact> =
                        batch.iter().map(|item| item.fact.clone()).collect();
                    let outcome = backend.write_reservations(&facts).await;
                    match outcome {
                        Ok(()) => {
                            metrics::counter!("flashsale_store_reservation_batches_total")
                                .increment(1);
                            for item in batch {
                                let _ = item.ack.send(Ok(()));
                                pending.fetch_sub(1, Ordering::AcqRel);
                            }
                        }
                        Err(err) => {
                            warn!(batch = facts.len(), error = %err, "reservation batch write failed");
                            let message = format!("reservation batch write failed: {err:#}");
                            for item in batch {
                                let _ = item.ack.send(Err(anyhow::anyhow!(message.clone())));
                                pending.fetch_sub(1, Ordering::AcqRel);
                            }
                        }
                    }
                }
                debug!("reservation flusher stopped");
            });
        }

        {
            let backend = Arc::clone(&backend);
            let pending = Arc::clone(&pending);
            let batch_size = config.purchase_batch;
            let flush_interval = config.purchase_flush;
            tokio::spawn(async move {
                while let Some(first) = purchase_rx.recv().await {
                    let batch =
                        collect_batch(&mut purchase_rx, first, batch_size, flush_interval).await;
                    metrics::counter!("flashsale_store_purchase_batches_total").increment(1);
                    for item in batch {
                        let outcome = backend.write_purchase(&item.fact).await;
                        let _ = item.ack.send(outcome);
                        pending.fetch_sub(1, Ordering::AcqRel);
                    }
                }
                debug!("purchase flusher stopped");
            });
        }

        Arc::new(Self {
            backend,
            reservation_tx,
            purchase_tx,
            pending,
            hard_flush_timeout: config.hard_flush_timeout,
        })
    }

    /// Appends not yet acknowledged.
    #[must_use]
    pub fn pending_count(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    async fn enqueue<T>(
        &self,
        tx: &mpsc::Sender<Pending<T>>,
        fact: T,
    ) -> anyhow::Result<()> {
        let (ack, rx) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::AcqRel);
        if tx.send(Pending { fact, ack }).await.is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            anyhow::bail!("store flusher has stopped");
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => anyhow::bail!("store flusher dropped the acknowledgement"),
        }
    }
}

#[async_trait]
impl DurableStore for BatchingStore {
    async fn append_reservation(&self, fact: ReservationFact) -> anyhow::Result<()> {
        self.enqueue(&self.reservation_tx, fact).await
    }

    async fn append_purchase(&self, fact: PurchaseFact) -> anyhow::Result<()> {
        self.enqueue(&self.purchase_tx, fact).await
    }

    async fn seed_window(&self, window_id: i64, items: i64) -> anyhow::Result<()> {
        self.backend.ensure_window(window_id, items).await
    }

    async fn recover_active_reservations(
        &self,
        now: UnixMillis,
    ) -> anyhow::Result<Vec<ReservationFact>> {
        self.backend.load_active_reservations(now).await
    }

    async fn recover_purchases(&self, window_id: i64) -> anyhow::Result<Vec<(i64, i64)>> {
        self.backend.load_purchases(window_id).await
    }

    async fn hard_flush(&self) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + self.hard_flush_timeout;
        while self.pending.load(Ordering::Acquire) > 0 {
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "hard flush timed out with {} appends pending",
                    self.pending.load(Ordering::Acquire)
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for BatchingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchingStore")
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::super::MemoryStore;
    use super::*;

    /// Backend wrapper that counts write calls, to observe coalescing.
    struct CountingBackend {
        inner: MemoryStore,
        reservation_writes: AtomicU64,
    }

    #[async_trait]
    impl StoreBackend for CountingBackend {
        async fn write_reservations(&self, batch: &[ReservationFact]) -> anyhow::Result<()> {
            self.reservation_writes.fetch_add(1, Ordering::SeqCst);
            self.inner.write_reservations(batch).await
        }
        async fn write_purchase(&self, fact: &PurchaseFact) -> anyhow::Result<()> {
            self.inner.write_purchase(fact).await
        }
        async fn ensure_window(&self, window_id: i64, items: i64) -> anyhow::Result<()> {
            self.inner.ensure_window(window_id, items).await
        }
        async fn load_active_reservations(
            &self,
            now: UnixMillis,
        ) -> anyhow::Result<Vec<ReservationFact>> {
            self.inner.load_active_reservations(now).await
        }
        async fn load_purchases(&self, window_id: i64) -> anyhow::Result<Vec<(i64, i64)>> {
            self.inner.load_purchases(window_id).await
        }
    }

    /// Backend whose batch writes always fail.
    struct BrokenBackend;

    #[async_trait]
    impl StoreBackend for BrokenBackend {
        async fn write_reservations(&self, _batch: &[ReservationFact]) -> anyhow::Result<()> {
            anyhow::bail!("disk on fire")
        }
        async fn write_purchase(&self, _fact: &PurchaseFact) -> anyhow::Result<()> {
            anyhow::bail!("disk on fire")
        }
        async fn ensure_window(&self, _window_id: i64, _items: i64) -> anyhow::Result<()> {
            Ok(())
        }
        async fn load_active_reservations(
            &self,
            _now: UnixMillis,
        ) -> anyhow::Result<Vec<ReservationFact>> {
            Ok(Vec::new())
        }
        async fn load_purchases(&self, _window_id: i64) -> anyhow::Result<Vec<(i64, i64)>> {
            Ok(Vec::new())
        }
    }

    fn fact(item: i64) -> ReservationFact {
        ReservationFact {
            code: Uuid::new_v4(),
            user_id: 1,
            item_index: item,
            created_at: 0,
            expires_at: 1_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_append_reaches_the_backend() {
        let backend = Arc::new(MemoryStore::new());
        let store = BatchingStore::spawn(
            Arc::clone(&backend) as Arc<dyn StoreBackend>,
            BatchConfig::default(),
        );

        store.append_reservation(fact(0)).await.unwrap();
        assert_eq!(backend.reservation_count(), 1);
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_appends_coalesce_into_one_batch() {
        let backend = Arc::new(CountingBackend {
            inner: MemoryStore::new(),
            reservation_writes: AtomicU64::new(0),
        });
        let store = BatchingStore::spawn(
            Arc::clone(&backend) as Arc<dyn StoreBackend>,
            BatchConfig::default(),
        );

        let mut tasks = tokio::task::JoinSet::new();
        for item in 0..5 {
            let store = Arc::clone(&store);
            tasks.spawn(async move { store.append_reservation(fact(item)).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        assert_eq!(backend.inner.reservation_count(), 5);
        // Paused time: the flusher saw all five before its deadline fired.
        assert_eq!(backend.reservation_writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn purchase_conflicts_ack_individually() {
        let backend = Arc::new(MemoryStore::new());
        let store = BatchingStore::spawn(
            Arc::clone(&backend) as Arc<dyn StoreBackend>,
            BatchConfig::default(),
        );
        store.seed_window(3, 4).await.unwrap();

        let purchase = PurchaseFact {
            window_id: 3,
            item_index: 0,
            user_id: 1,
            purchased_at: 10,
        };
        store.append_purchase(purchase).await.unwrap();

        let duplicate = PurchaseFact { user_id: 2, ..purchase };
        assert!(store.append_purchase(duplicate).await.is_err());
        assert_eq!(backend.purchased_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_fails_every_waiter() {
        let store = BatchingStore::spawn(
            Arc::new(BrokenBackend) as Arc<dyn StoreBackend>,
            BatchConfig::default(),
        );

        let mut tasks = tokio::task::JoinSet::new();
        for item in 0..3 {
            let store = Arc::clone(&store);
            tasks.spawn(async move { store.append_reservation(fact(item)).await });
        }
        while let Some(result) = tasks.join_next().await {
            assert!(result.unwrap().is_err());
        }
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_flush_waits_for_quiet_queues() {
        let backend = Arc::new(MemoryStore::new());
        let store = BatchingStore::spawn(
            Arc::clone(&backend) as Arc<dyn StoreBackend>,
            BatchConfig::default(),
        );

        store.append_reservation(fact(0)).await.unwrap();
        store.hard_flush().await.unwrap();
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_reads_pass_through() {
        let backend = Arc::new(MemoryStore::new());
        let store = BatchingStore::spawn(
            Arc::clone(&backend) as Arc<dyn StoreBackend>,
            BatchConfig::default(),
        );

        store.seed_window(1, 2).await.unwrap();
        store.append_reservation(fact(0)).await.unwrap();
        store
            .append_purchase(PurchaseFact {
                window_id: 1,
                item_index: 1,
                user_id: 8,
                purchased_at: 10,
            })
            .await
            .unwrap();

        assert_eq!(store.recover_active_reservations(0).await.unwrap().len(), 1);
        assert_eq!(
            store.recover_purchases(1).await.unwrap(),
            vec![(1, 8)]
        );
    }
}
