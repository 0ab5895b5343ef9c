//! Optimistic concurrency primitives.

use crate::error::{LedgerError, LedgerResult};

/// Version an account must still be at for a compare-and-swap to apply.
///
/// Accounts start at version 1 and every committed mutation bumps the version
/// by exactly one, so the expectation is always an exact value read earlier in
/// the same transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ExpectedVersion(u64);

impl ExpectedVersion {
    pub fn exact(version: u64) -> Self {
        Self(version)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Version the row carries once the swap succeeds.
    pub fn next(self) -> u64 {
        self.0 + 1
    }

    pub fn matches(self, actual: u64) -> bool {
        self.0 == actual
    }

    pub fn check(self, actual: u64) -> LedgerResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(LedgerError::conflict(format!(
                "optimistic concurrency check failed (expected: {}, actual: {actual})",
                self.0
            )))
        }
    }
}
