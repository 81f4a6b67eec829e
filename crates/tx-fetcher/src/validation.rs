//! Verification of announced metadata against delivered transactions.
//!
//! Announcement metadata is only a claim until the transaction arrives. Once
//! it does, the claim is checked: a peer that announced a different consensus
//! type, or a size off by more than a few bytes, is lying and gets dropped.

use crate::{constants::MAX_ANNOUNCED_SIZE_DEVIATION, primitives::TxMetadata};

/// Outcome of comparing announced metadata against the delivered encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// The announcement matches the delivered transaction.
    Valid,
    /// The announced size is off, but within the tolerated wiggle room that
    /// encoding ambiguity between clients can explain. Log only.
    Warn,
    /// The announcement contradicts the delivered transaction. The announcing
    /// peer should be disconnected.
    ReportPeer,
}

/// Verifies the metadata a peer announced for a hash against the metadata
/// observed on the delivered transaction.
pub fn verify_announced_metadata(
    announced: &TxMetadata,
    delivered: &TxMetadata,
) -> ValidationOutcome {
    if announced.kind != delivered.kind {
        return ValidationOutcome::ReportPeer;
    }
    if announced.size != delivered.size {
        if announced.size.abs_diff(delivered.size) > MAX_ANNOUNCED_SIZE_DEVIATION {
            return ValidationOutcome::ReportPeer;
        }
        return ValidationOutcome::Warn;
    }
    ValidationOutcome::Valid
}
