//! Frontend for the transaction fetcher.
//!
//! The handle performs the work that doesn't need the loop's indices — pool
//! pre-filtering of announcements and pool import of deliveries — and then
//! serialises the residue onto the event channel. It is cheap to clone and
//! safe to use from any task.

use crate::{
    cache::UnderpricedCache,
    constants::{POOL_IMPORT_BATCH_SIZE, STALE_DELIVERY_BACKOFF, STALE_DELIVERY_THRESHOLD},
    error::FetcherError,
    message::{FetcherEvent, NewPooledTransactionHashes, TxAnnounce, TxDelivery},
    metrics::{AnnounceMetrics, DeliveryMetrics},
    pool::{DynTxPool, PoolImportError},
    primitives::{PeerId, PooledTransaction, TxMetadata},
};
use itertools::izip;
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tokio::{sync::mpsc, time};
use tracing::debug;

/// Frontend to a spawned [`TxFetcher`](crate::TxFetcher) event loop.
#[derive(Clone)]
pub struct TxFetcherHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    to_fetcher: mpsc::UnboundedSender<FetcherEvent>,
    pool: DynTxPool,
    underpriced: Arc<Mutex<UnderpricedCache>>,
    announce_metrics: AnnounceMetrics,
    delivery_metrics: DeliveryMetrics,
}

impl TxFetcherHandle {
    pub(crate) fn new(
        to_fetcher: mpsc::UnboundedSender<FetcherEvent>,
        pool: DynTxPool,
        underpriced: Arc<Mutex<UnderpricedCache>>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                to_fetcher,
                pool,
                underpriced,
                announce_metrics: Default::default(),
                delivery_metrics: Default::default(),
            }),
        }
    }

    /// Announces the potential availability of a batch of transactions.
    ///
    /// Hashes the pool already knows and hashes recently rejected as
    /// underpriced are filtered out here, concurrent to the loop; whatever
    /// is left is pushed to it. The check is racy against other concurrent
    /// notifies, but anything caught here is time saved internally.
    ///
    /// Returns [`FetcherError::Terminated`] if the fetcher has shut down.
    pub fn notify(
        &self,
        peer: PeerId,
        announcement: NewPooledTransactionHashes,
    ) -> Result<(), FetcherError> {
        let NewPooledTransactionHashes { types, sizes, hashes } = announcement;
        debug_assert!(
            types.len() == hashes.len() && sizes.len() == hashes.len(),
            "announcement arrays must be parallel"
        );
        self.inner.announce_metrics.announces_in.increment(hashes.len() as u64);

        let mut unknown_hashes = Vec::with_capacity(hashes.len());
        let mut unknown_metas = Vec::with_capacity(hashes.len());
        let mut known = 0u64;
        let mut underpriced = 0u64;
        for (kind, size, hash) in izip!(types, sizes, hashes) {
            if self.inner.pool.has_tx(&hash) {
                known += 1;
            } else if self.inner.underpriced.lock().contains(&hash) {
                underpriced += 1;
            } else {
                unknown_hashes.push(hash);
                unknown_metas.push(TxMetadata { kind, size });
            }
        }
        self.inner.announce_metrics.announces_known.increment(known);
        self.inner.announce_metrics.announces_underpriced.increment(underpriced);

        if unknown_hashes.is_empty() {
            return Ok(());
        }
        self.send(FetcherEvent::Announce(TxAnnounce {
            origin: peer,
            hashes: unknown_hashes,
            metas: unknown_metas,
        }))
    }

    /// Imports a batch of received transactions into the pool and notifies
    /// the fetcher so it untracks the hashes. Called for both gossip
    /// broadcasts (`direct = false`) and request replies (`direct = true`);
    /// the distinction lets the fetcher reschedule missing transactions as
    /// soon as possible.
    ///
    /// Underpriced rejects are remembered in the negative cache. A batch with
    /// more than 25 % unexpected rejects backs off for a moment, soft
    /// pressure against peers flooding junk.
    ///
    /// Returns [`FetcherError::Terminated`] if the fetcher has shut down.
    pub async fn enqueue(
        &self,
        peer: PeerId,
        txs: Vec<PooledTransaction>,
        direct: bool,
    ) -> Result<(), FetcherError> {
        let (in_counter, known_counter, underpriced_counter, other_counter) =
            self.inner.delivery_metrics.class(direct);
        in_counter.increment(txs.len() as u64);

        let mut hashes = Vec::with_capacity(txs.len());
        let mut metas = Vec::with_capacity(txs.len());
        for batch in txs.chunks(POOL_IMPORT_BATCH_SIZE) {
            let mut known = 0u64;
            let mut underpriced = 0u64;
            let mut other_reject = 0u64;

            for (tx, result) in batch.iter().zip(self.inner.pool.add_txs(peer, batch)) {
                if let Err(error) = result {
                    // Remember hashes rejected for being too cheap so further
                    // announcements of them are ignored for a while.
                    if error.is_underpriced() {
                        self.inner.underpriced.lock().insert(tx.hash());
                    }
                    match error {
                        PoolImportError::AlreadyKnown => known += 1,
                        PoolImportError::Underpriced | PoolImportError::ReplaceUnderpriced => {
                            underpriced += 1
                        }
                        PoolImportError::Other(_) => other_reject += 1,
                    }
                }
                // every hash is forwarded, whatever the import outcome
                hashes.push(tx.hash());
                metas.push(tx.metadata());
            }
            known_counter.increment(known);
            underpriced_counter.increment(underpriced);
            other_counter.increment(other_reject);

            if other_reject > STALE_DELIVERY_THRESHOLD {
                debug!(target: "fetcher::tx", peer_id = %peer, rejected = other_reject, "peer delivering stale transactions");
                time::sleep(STALE_DELIVERY_BACKOFF).await;
            }
        }

        self.send(FetcherEvent::Delivery(TxDelivery { origin: peer, hashes, metas, direct }))
    }

    /// Tells the fetcher a peer disconnected so all its traces are purged.
    ///
    /// Returns [`FetcherError::Terminated`] if the fetcher has shut down.
    pub fn peer_dropped(&self, peer: PeerId) -> Result<(), FetcherError> {
        self.send(FetcherEvent::PeerDrop(peer))
    }

    /// Shuts the fetcher loop down. In-flight wire requests are abandoned.
    pub fn terminate(&self) {
        let _ = self.inner.to_fetcher.send(FetcherEvent::Quit);
    }

    fn send(&self, event: FetcherEvent) -> Result<(), FetcherError> {
        self.inner.to_fetcher.send(event).map_err(|_| FetcherError::Terminated)
    }
}

impl fmt::Debug for TxFetcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxFetcherHandle").finish_non_exhaustive()
    }
}
