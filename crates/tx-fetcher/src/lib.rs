#![warn(missing_docs, unreachable_pub, unused_crate_dependencies)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Announcement-driven transaction fetching for a p2p gossip layer.
//!
//! Peers advertise transactions by hash together with a small metadata tuple
//! (consensus type and encoded size). The [`TxFetcher`] decides which hashes
//! to request, from which peer and when, under adversarial conditions: peers
//! may announce non-existent hashes, flood, withhold replies or lie about
//! metadata.
//!
//! Announced hashes move through three stages. A new hash first *waits* a
//! short window for the full transaction to arrive over gossip, making a
//! request unnecessary. Hashes that don't show up get *queued* and the
//! scheduler assembles per-peer retrieval requests from the queue — one
//! request per peer at a time, in announcement order, bounded in count and
//! announced byte size. A *fetching* hash either arrives (from the asked
//! peer or stolen by a broadcast from elsewhere), or its request times out
//! and the hash falls back to an alternate announcer.
//!
//! The fetcher core is a single event loop owning every index; producers
//! interact with it through the cloneable [`TxFetcherHandle`]. The pool and
//! the wire layer are injected as [`TxPoolHandle`] and [`FetchClient`]
//! capabilities.

mod cache;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
mod fetcher;
mod handle;
pub mod message;
mod metrics;
pub mod pool;
pub mod primitives;
pub mod validation;

#[cfg(test)]
mod test_utils;

pub use client::{DynFetchClient, FetchClient, RequestError};
pub use config::TxFetcherConfig;
pub use error::FetcherError;
pub use fetcher::TxFetcher;
pub use handle::TxFetcherHandle;
pub use message::NewPooledTransactionHashes;
pub use pool::{DynTxPool, PoolImportError, PoolImportResult, TxPoolHandle};
pub use primitives::{PeerId, PooledTransaction, TxHash, TxMetadata, BLOB_TX_TYPE_ID};
