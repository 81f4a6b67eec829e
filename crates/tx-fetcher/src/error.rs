//! Possible errors when interacting with the fetcher.

/// All error variants for the fetcher frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FetcherError {
    /// The fetcher event loop has shut down and no longer accepts events.
    #[error("transaction fetcher terminated")]
    Terminated,
}
