//! Negative cache for recently rejected cheap transactions.

use crate::primitives::TxHash;
use schnellru::{ByLength, LruMap};
use std::time::Duration;
use tokio::time::Instant;

/// Bounded LRU of transaction hashes the pool rejected as underpriced, so the
/// same hash isn't re-requested every time another peer announces it.
///
/// Entries expire after a fixed timeout; expiry is checked lazily on lookup
/// so the cache needs no sweeper.
pub(crate) struct UnderpricedCache {
    entries: LruMap<TxHash, Instant, ByLength>,
    timeout: Duration,
}

impl UnderpricedCache {
    /// Creates a cache holding at most `capacity` hashes, each for at most
    /// `timeout`.
    pub(crate) fn new(capacity: u32, timeout: Duration) -> Self {
        Self { entries: LruMap::new(ByLength::new(capacity)), timeout }
    }

    /// Records a hash as underpriced. Evicts the least recently used entry if
    /// the cache is full.
    pub(crate) fn insert(&mut self, hash: TxHash) {
        self.entries.insert(hash, Instant::now());
    }

    /// Returns `true` if the hash was recently found to be underpriced.
    ///
    /// An entry past its timeout is removed and reported absent.
    pub(crate) fn contains(&mut self, hash: &TxHash) -> bool {
        let Some(inserted) = self.entries.peek(hash) else { return false };
        if inserted.elapsed() > self.timeout {
            self.entries.remove(hash);
            return false;
        }
        true
    }

    /// Number of cached hashes.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl std::fmt::Debug for UnderpricedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnderpricedCache")
            .field("len", &self.entries.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
