//! Message types crossing the ingress/loop boundary.

use crate::primitives::{PeerId, TxHash, TxMetadata};

/// Announcement of transaction availability as decoded from the wire: three
/// parallel arrays of consensus type bytes, encoded sizes and hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewPooledTransactionHashes {
    /// Transaction consensus type bytes, one per hash.
    pub types: Vec<u8>,
    /// Encoded transaction sizes in bytes, one per hash.
    pub sizes: Vec<u32>,
    /// The announced transaction hashes.
    pub hashes: Vec<TxHash>,
}

impl NewPooledTransactionHashes {
    /// Creates an announcement message from parallel arrays.
    ///
    /// The arrays must be of equal length.
    pub fn new(types: Vec<u8>, sizes: Vec<u32>, hashes: Vec<TxHash>) -> Self {
        debug_assert!(
            types.len() == hashes.len() && sizes.len() == hashes.len(),
            "announcement arrays must be parallel"
        );
        Self { types, sizes, hashes }
    }

    /// Number of announced hashes.
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// Returns `true` if nothing is announced.
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// A batch of announced hashes that survived the ingress pre-filters,
/// together with the peer that sent them.
#[derive(Debug)]
pub(crate) struct TxAnnounce {
    /// Peer that originated the announcement.
    pub(crate) origin: PeerId,
    /// Announced hashes, in announcement order.
    pub(crate) hashes: Vec<TxHash>,
    /// Announced metadata, parallel to `hashes`.
    pub(crate) metas: Vec<TxMetadata>,
}

/// Notification that a batch of transactions went through the pool and the
/// fetcher should untrack the hashes.
#[derive(Debug)]
pub(crate) struct TxDelivery {
    /// Peer the transactions arrived from.
    pub(crate) origin: PeerId,
    /// Delivered hashes, in delivery order.
    pub(crate) hashes: Vec<TxHash>,
    /// Metadata observed on the delivered transactions, parallel to `hashes`.
    pub(crate) metas: Vec<TxMetadata>,
    /// `true` if this was the reply to an explicit request, `false` for a
    /// gossip broadcast.
    pub(crate) direct: bool,
}

/// Events serialised onto the fetcher loop.
#[derive(Debug)]
pub(crate) enum FetcherEvent {
    /// A pre-filtered announcement batch.
    Announce(TxAnnounce),
    /// A delivery that went through the pool.
    Delivery(TxDelivery),
    /// A peer disconnected.
    PeerDrop(PeerId),
    /// Shut the loop down.
    Quit,
}
