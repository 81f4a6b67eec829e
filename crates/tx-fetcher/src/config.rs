//! Configuration for the transaction fetcher.

use crate::constants::{
    MAX_ANNOUNCED_BYTES_PER_REQUEST, MAX_ANNOUNCED_HASHES_PER_PEER, MAX_HASHES_PER_REQUEST,
    MAX_UNDERPRICED_SET_SIZE, TX_ARRIVE_TIMEOUT, TX_FETCH_TIMEOUT, TX_GATHER_SLACK,
    UNDERPRICED_ENTRY_TIMEOUT,
};
use derive_more::Constructor;
use std::time::Duration;

/// Configuration for fetching announced transactions.
///
/// Defaults mirror the constants in [`crate::constants`]; tests tighten them
/// to keep scenarios small.
#[derive(Debug, Clone, Constructor)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TxFetcherConfig {
    /// Max hashes a single peer may have live in the fetcher.
    pub max_announced_hashes_per_peer: usize,
    /// Max hashes packed into a single retrieval request.
    pub max_hashes_per_request: usize,
    /// Max announced byte size accumulated by a single retrieval request.
    pub max_announced_bytes_per_request: u64,
    /// Broadcast wait before an announced hash becomes requestable.
    pub tx_arrive_timeout: Duration,
    /// Timer granularity for collating almost-expired entries.
    pub tx_gather_slack: Duration,
    /// Deadline for a peer to answer a retrieval request.
    pub tx_fetch_timeout: Duration,
    /// Capacity of the underpriced negative cache.
    pub max_underpriced_set_size: u32,
    /// Age at which underpriced cache entries expire.
    pub underpriced_entry_timeout: Duration,
}

impl Default for TxFetcherConfig {
    fn default() -> Self {
        Self {
            max_announced_hashes_per_peer: MAX_ANNOUNCED_HASHES_PER_PEER,
            max_hashes_per_request: MAX_HASHES_PER_REQUEST,
            max_announced_bytes_per_request: MAX_ANNOUNCED_BYTES_PER_REQUEST,
            tx_arrive_timeout: TX_ARRIVE_TIMEOUT,
            tx_gather_slack: TX_GATHER_SLACK,
            tx_fetch_timeout: TX_FETCH_TIMEOUT,
            max_underpriced_set_size: MAX_UNDERPRICED_SET_SIZE,
            underpriced_entry_timeout: UNDERPRICED_ENTRY_TIMEOUT,
        }
    }
}
