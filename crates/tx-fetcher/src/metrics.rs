//! Metrics for the transaction fetcher.

use metrics::{Counter, Gauge};
use metrics_derive::Metrics;

/// Counters bumped while pre-filtering announcements, outside the fetcher
/// loop.
#[derive(Metrics)]
#[metrics(scope = "fetcher.transactions")]
pub(crate) struct AnnounceMetrics {
    /// Total number of announced hashes received
    pub(crate) announces_in: Counter,
    /// Announced hashes skipped because the pool already has the transaction
    pub(crate) announces_known: Counter,
    /// Announced hashes skipped because the hash was recently underpriced
    pub(crate) announces_underpriced: Counter,
}

/// Counters bumped while importing delivered transactions into the pool,
/// outside the fetcher loop. Broadcasts and request replies are counted
/// separately.
#[derive(Metrics)]
#[metrics(scope = "fetcher.transactions")]
pub(crate) struct DeliveryMetrics {
    /// Total number of transactions received over broadcast
    pub(crate) broadcasts_in: Counter,
    /// Broadcast transactions the pool already knew
    pub(crate) broadcasts_known: Counter,
    /// Broadcast transactions the pool rejected as underpriced
    pub(crate) broadcasts_underpriced: Counter,
    /// Broadcast transactions the pool rejected for any other reason
    pub(crate) broadcasts_other_reject: Counter,

    /// Total number of transactions received as request replies
    pub(crate) replies_in: Counter,
    /// Reply transactions the pool already knew
    pub(crate) replies_known: Counter,
    /// Reply transactions the pool rejected as underpriced
    pub(crate) replies_underpriced: Counter,
    /// Reply transactions the pool rejected for any other reason
    pub(crate) replies_other_reject: Counter,
}

impl DeliveryMetrics {
    /// Returns the `(in, known, underpriced, other_reject)` counters for the
    /// given delivery direction.
    pub(crate) fn class(&self, direct: bool) -> (&Counter, &Counter, &Counter, &Counter) {
        if direct {
            (&self.replies_in, &self.replies_known, &self.replies_underpriced, &self.replies_other_reject)
        } else {
            (
                &self.broadcasts_in,
                &self.broadcasts_known,
                &self.broadcasts_underpriced,
                &self.broadcasts_other_reject,
            )
        }
    }
}

/// Counters and gauges maintained by the fetcher loop itself.
#[derive(Metrics)]
#[metrics(scope = "fetcher.transactions")]
pub(crate) struct TxFetcherMetrics {
    /// Announced hashes dropped by the per-peer cap
    pub(crate) announces_dos: Counter,

    /// Hashes packed into outbound retrieval requests
    pub(crate) requests_out: Counter,
    /// Hashes in requests that failed to dispatch
    pub(crate) requests_fail: Counter,
    /// Hashes resolved by direct request replies
    pub(crate) requests_done: Counter,
    /// Hashes in requests that timed out
    pub(crate) requests_timeout: Counter,

    /// Number of peers with hashes in the waiting stage
    pub(crate) waiting_peers: Gauge,
    /// Number of hashes in the waiting stage
    pub(crate) waiting_hashes: Gauge,
    /// Number of peers with queued hashes and no request in flight
    pub(crate) queueing_peers: Gauge,
    /// Number of hashes in the queued stage
    pub(crate) queueing_hashes: Gauge,
    /// Number of peers with a request in flight
    pub(crate) fetching_peers: Gauge,
    /// Number of hashes in the fetching stage
    pub(crate) fetching_hashes: Gauge,
}
