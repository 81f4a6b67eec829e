//! Default limits and timings of the transaction fetcher.

use std::time::Duration;

/* ==================== ANNOUNCEMENTS ==================== */

/// Maximum number of unique transaction hashes a single peer may have live in
/// the fetcher (waiting plus queued plus fetching) at any time. Announcements
/// past this limit are dropped without disconnecting the peer, since partial
/// request fulfilment legitimately reschedules hashes without a cap check.
pub const MAX_ANNOUNCED_HASHES_PER_PEER: usize = 4096;

/// Time allowance before an announced transaction is explicitly requested.
/// Most transactions arrive in full over gossip within this window, making
/// the request unnecessary.
pub const TX_ARRIVE_TIMEOUT: Duration = Duration::from_millis(500);

/// Granularity of both fetcher timers. Almost-expired entries within this
/// slack are collated into the current timer fire instead of spinning the
/// timer again a few milliseconds later.
pub const TX_GATHER_SLACK: Duration = Duration::from_millis(100);

/* ==================== RETRIEVAL ==================== */

/// Maximum number of hashes packed into one retrieval request. Large enough
/// to amortise the round trip, small enough to spread deliveries across the
/// peer set, and a failsafe against malicious announcement floods.
pub const MAX_HASHES_PER_REQUEST: usize = 256;

/// Maximum announced byte size a single retrieval request may accumulate.
/// 128 KiB limits a request to roughly one blob transaction so no connection
/// is hogged between two peers.
pub const MAX_ANNOUNCED_BYTES_PER_REQUEST: u64 = 128 * 1024;

/// Maximum allotted time for a peer to answer an explicit retrieval request.
pub const TX_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/* ==================== UNDERPRICED CACHE ==================== */

/// Capacity of the negative cache of recently-rejected cheap transactions.
pub const MAX_UNDERPRICED_SET_SIZE: u32 = 32768;

/// Maximum time a hash stays in the underpriced cache.
pub const UNDERPRICED_ENTRY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/* ==================== DELIVERY ==================== */

/// Number of delivered transactions handed to the pool per import call.
pub const POOL_IMPORT_BATCH_SIZE: usize = 128;

/// Backoff applied between import batches when a peer floods rejects, see
/// [`STALE_DELIVERY_THRESHOLD`].
pub const STALE_DELIVERY_BACKOFF: Duration = Duration::from_millis(200);

/// Number of non-trivial pool rejects in one import batch (>25 % of
/// [`POOL_IMPORT_BATCH_SIZE`]) above which delivery processing backs off.
pub const STALE_DELIVERY_THRESHOLD: u64 = (POOL_IMPORT_BATCH_SIZE / 4) as u64;

/// Tolerated deviation in bytes between an announced transaction size and the
/// delivered encoding. Within this wiggle room only a warning is logged,
/// outside it the announcing peer is disconnected.
pub const MAX_ANNOUNCED_SIZE_DEVIATION: u32 = 8;
