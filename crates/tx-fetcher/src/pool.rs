//! Interface to the local transaction pool.
//!
//! The pool decides what a transaction is worth; the fetcher only needs to
//! know whether a hash is already present and how an import attempt ended.

use crate::primitives::{PeerId, PooledTransaction, TxHash};
use std::sync::Arc;

/// Per-transaction outcome of a pool import.
pub type PoolImportResult = Result<(), PoolImportError>;

/// Recognisable rejection kinds reported by the pool for a single
/// transaction. Only the variants the fetcher reacts to are distinguished;
/// everything else is folded into [`PoolImportError::Other`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolImportError {
    /// The pool already contains this transaction.
    #[error("transaction already known")]
    AlreadyKnown,
    /// The transaction's fee is below the pool's acceptance threshold.
    #[error("transaction underpriced")]
    Underpriced,
    /// The transaction tried to replace an existing one without paying the
    /// required price bump.
    #[error("replacement transaction underpriced")]
    ReplaceUnderpriced,
    /// Any other rejection. The message is kept for logging only.
    #[error("transaction rejected: {0}")]
    Other(String),
}

impl PoolImportError {
    /// Returns `true` for the rejection kinds that should land the hash in
    /// the underpriced negative cache.
    pub const fn is_underpriced(&self) -> bool {
        matches!(self, Self::Underpriced | Self::ReplaceUnderpriced)
    }
}

/// Capabilities the fetcher needs from the local transaction pool.
pub trait TxPoolHandle: Send + Sync + 'static {
    /// Returns `true` if the pool already tracks the given hash.
    fn has_tx(&self, hash: &TxHash) -> bool;

    /// Imports a batch of transactions received from `origin`.
    ///
    /// Must return one result per input transaction, in input order.
    fn add_txs(&self, origin: PeerId, txs: &[PooledTransaction]) -> Vec<PoolImportResult>;
}

/// Shared dynamic reference to a [`TxPoolHandle`].
pub type DynTxPool = Arc<dyn TxPoolHandle>;
