//! Integrity verification results.
//!
//! Verification never throws on a bad event; findings are reported
//! in-band and the caller inspects the report.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a stored event failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Recomputed digest differs from the stored `hash`.
    DigestMismatch,
    /// Signature does not verify against the canonical form.
    SignatureInvalid,
    /// `previous_hash` does not match the expected prior link.
    ChainBreak,
    /// Non-genesis event with no `previous_hash` at all.
    MissingPrevious,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub id: Uuid,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub total: u64,
    pub verified: u64,
    pub failed: Vec<ValidationFailure>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
