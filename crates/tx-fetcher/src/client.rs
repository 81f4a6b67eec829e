//! Interface to the wire layer.

use crate::primitives::{PeerId, TxHash};
use std::sync::Arc;

/// Error variants of dispatching a transaction request to a peer's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The channel to the peer's session task is closed.
    #[error("peer session channel closed")]
    ChannelClosed,
    /// The connection to the peer dropped while dispatching.
    #[error("connection to peer dropped")]
    ConnectionDropped,
    /// The session rejected the request.
    #[error("request rejected by session")]
    Rejected,
}

/// Capabilities the fetcher needs from the p2p layer.
///
/// Implementations forward to per-peer session tasks; none of these calls may
/// block for network round trips. Replies and broadcasts come back through
/// [`TxFetcherHandle::enqueue`](crate::TxFetcherHandle::enqueue).
pub trait FetchClient: Send + Sync + 'static {
    /// Issues a wire request for the given hashes to the given peer.
    ///
    /// An error means the request never left this node; the fetcher reacts by
    /// dropping the peer and rescheduling the hashes elsewhere.
    fn fetch_txs(&self, peer: PeerId, hashes: Vec<TxHash>) -> Result<(), RequestError>;

    /// Disconnects a peer that violated the announcement protocol.
    fn disconnect_peer(&self, peer: PeerId);
}

/// Shared dynamic reference to a [`FetchClient`].
pub type DynFetchClient = Arc<dyn FetchClient>;
