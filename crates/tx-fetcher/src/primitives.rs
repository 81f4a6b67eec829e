//! Minimal transaction primitives consumed by the fetcher.
//!
//! The fetcher never decodes a transaction; it only schedules retrievals by
//! hash and cross-checks the small metadata tuple that travels with an
//! announcement. Everything else about a transaction is the pool's business.

pub use alloy_primitives::{B256, B512};

/// A transaction hash.
pub type TxHash = B256;

/// Identifier of a remote peer session.
///
/// The fetcher treats this as an opaque key; it is never inspected beyond
/// equality and hashing.
pub type PeerId = B512;

/// Consensus type byte of blob transactions.
///
/// Blob transactions are announce-and-fetch only, they are never broadcast in
/// full, so the fetcher skips the broadcast wait for them.
pub const BLOB_TX_TYPE_ID: u8 = 3;

/// Metadata transmitted along with a transaction announcement, used for
/// fetch scheduling and for catching peers that lie about what they announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxMetadata {
    /// Transaction consensus type byte.
    pub kind: u8,
    /// Length of the encoded transaction in bytes.
    pub size: u32,
}

impl TxMetadata {
    /// Returns `true` if this entry announces a blob transaction.
    pub const fn is_blob(&self) -> bool {
        self.kind == BLOB_TX_TYPE_ID
    }
}

/// A transaction as delivered by a peer, reduced to the view the fetcher and
/// pool interface need: its hash and the metadata observed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PooledTransaction {
    hash: TxHash,
    kind: u8,
    size: u32,
}

impl PooledTransaction {
    /// Creates a new pooled transaction view.
    pub const fn new(hash: TxHash, kind: u8, size: u32) -> Self {
        Self { hash, kind, size }
    }

    /// Hash of the transaction.
    pub const fn hash(&self) -> TxHash {
        self.hash
    }

    /// Consensus type byte.
    pub const fn kind(&self) -> u8 {
        self.kind
    }

    /// Encoded length in bytes.
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// The metadata tuple actually observed for this transaction, compared
    /// against whatever peers announced for the same hash.
    pub const fn metadata(&self) -> TxMetadata {
        TxMetadata { kind: self.kind, size: self.size }
    }
}
