//! Whole-unit monetary amounts.

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};

/// Maximum remarks length accepted on a ledger mutation.
pub const MAX_REMARKS_LEN: usize = 50;

/// A strictly positive amount in whole currency units.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

impl Amount {
    pub fn new(value: i64) -> LedgerResult<Self> {
        if value < 1 {
            return Err(LedgerError::validation(format!(
                "amount must be at least 1 (got {value})"
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for Amount {
    type Error = LedgerError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Amount::new(value)
    }
}

impl From<Amount> for i64 {
    fn from(value: Amount) -> Self {
        value.0
    }
}

impl core::fmt::Display for Amount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Normalise optional remarks: blank becomes `None`, overlong is rejected.
pub fn validate_remarks(remarks: Option<String>) -> LedgerResult<Option<String>> {
    match remarks {
        Some(r) if r.trim().is_empty() => Ok(None),
        Some(r) if r.chars().count() > MAX_REMARKS_LEN => Err(LedgerError::validation(format!(
            "remarks must be at most {MAX_REMARKS_LEN} characters"
        ))),
        other => Ok(other),
    }
}
