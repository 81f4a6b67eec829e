//! Mock pool and client implementations shared by the unit tests.

use crate::{
    client::{FetchClient, RequestError},
    pool::{PoolImportError, PoolImportResult, TxPoolHandle},
    primitives::{PeerId, PooledTransaction, TxHash},
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

/// Installs a tracing subscriber driven by `RUST_LOG`, once per process.
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Builds a distinct hash from a small integer.
pub(crate) fn hash_n(n: u64) -> TxHash {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    TxHash::new(bytes)
}

/// Builds a distinct peer id from a small integer.
pub(crate) fn peer_n(n: u8) -> PeerId {
    PeerId::repeat_byte(n)
}

/// In-memory transaction pool with scriptable per-hash import outcomes.
#[derive(Default)]
pub(crate) struct MockPool {
    txs: Mutex<HashSet<TxHash>>,
    rejections: Mutex<HashMap<TxHash, PoolImportError>>,
    batch_sizes: Mutex<Vec<usize>>,
}

impl MockPool {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pre-seeds the pool with a hash.
    pub(crate) fn insert(&self, hash: TxHash) {
        self.txs.lock().insert(hash);
    }

    /// Makes every import of the given hash fail with the given error.
    pub(crate) fn reject_with(&self, hash: TxHash, error: PoolImportError) {
        self.rejections.lock().insert(hash, error);
    }

    pub(crate) fn contains(&self, hash: &TxHash) -> bool {
        self.txs.lock().contains(hash)
    }

    /// Sizes of the import batches seen so far.
    pub(crate) fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }
}

impl TxPoolHandle for MockPool {
    fn has_tx(&self, hash: &TxHash) -> bool {
        self.txs.lock().contains(hash)
    }

    fn add_txs(&self, _origin: PeerId, txs: &[PooledTransaction]) -> Vec<PoolImportResult> {
        self.batch_sizes.lock().push(txs.len());
        txs.iter()
            .map(|tx| {
                if let Some(error) = self.rejections.lock().get(&tx.hash()) {
                    return Err(error.clone());
                }
                if !self.txs.lock().insert(tx.hash()) {
                    return Err(PoolImportError::AlreadyKnown);
                }
                Ok(())
            })
            .collect()
    }
}

/// Wire client recording requests and disconnects.
#[derive(Default)]
pub(crate) struct MockClient {
    requests: Mutex<Vec<(PeerId, Vec<TxHash>)>>,
    failing: Mutex<HashSet<PeerId>>,
    disconnected: Mutex<Vec<PeerId>>,
}

impl MockClient {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes request dispatch to the given peer fail.
    pub(crate) fn fail_requests_for(&self, peer: PeerId) {
        self.failing.lock().insert(peer);
    }

    /// All requests dispatched so far, in order.
    pub(crate) fn requests(&self) -> Vec<(PeerId, Vec<TxHash>)> {
        self.requests.lock().clone()
    }

    /// All peers disconnected so far, in order.
    pub(crate) fn disconnected(&self) -> Vec<PeerId> {
        self.disconnected.lock().clone()
    }
}

impl FetchClient for MockClient {
    fn fetch_txs(&self, peer: PeerId, hashes: Vec<TxHash>) -> Result<(), RequestError> {
        if self.failing.lock().contains(&peer) {
            return Err(RequestError::ChannelClosed);
        }
        self.requests.lock().push((peer, hashes));
        Ok(())
    }

    fn disconnect_peer(&self, peer: PeerId) {
        self.disconnected.lock().push(peer);
    }
}
