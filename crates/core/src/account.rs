//! Account model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::error::{LedgerError, LedgerResult};
use crate::id::AccountId;
use crate::ledger::EntryType;
use crate::version::ExpectedVersion;

/// Version a freshly registered account starts at.
pub const INITIAL_VERSION: u64 = 1;

/// One account row.
///
/// The balance is only ever changed through a compare-and-swap on `version`;
/// use [`Account::apply`] to compute the next balance and
/// [`Account::expected_version`] for the swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// External handle (phone number), unique across accounts.
    pub handle: String,
    pub balance: i64,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// A newly registered account: zero balance, version 1.
    pub fn open(handle: impl Into<String>, now: DateTime<Utc>) -> LedgerResult<Self> {
        let handle = handle.into();
        validate_handle(&handle)?;
        Ok(Self {
            id: AccountId::new(),
            handle,
            balance: 0,
            version: INITIAL_VERSION,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn expected_version(&self) -> ExpectedVersion {
        ExpectedVersion::exact(self.version)
    }

    /// Balance after applying `amount` in `direction`.
    ///
    /// Debits never take the balance below zero.
    pub fn apply(&self, direction: EntryType, amount: Amount) -> LedgerResult<i64> {
        match direction {
            EntryType::Credit => self.balance.checked_add(amount.get()).ok_or_else(|| {
                LedgerError::validation("credit overflows balance").with_account(self.id)
            }),
            EntryType::Debit => {
                if self.balance < amount.get() {
                    return Err(LedgerError::insufficient_funds(self.balance, amount.get())
                        .with_handle(self.handle.clone())
                        .with_account(self.id));
                }
                Ok(self.balance - amount.get())
            }
        }
    }

    /// State of the row once a swap to `new_balance` commits.
    pub fn mutated(&self, new_balance: i64, now: DateTime<Utc>) -> Self {
        Self {
            balance: new_balance,
            version: self.version + 1,
            updated_at: now,
            ..self.clone()
        }
    }
}

/// Handles are phone numbers: digits with an optional leading `+`.
pub fn validate_handle(handle: &str) -> LedgerResult<()> {
    let digits = handle.strip_prefix('+').unwrap_or(handle);
    if digits.len() < 3 || digits.len() > 20 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(LedgerError::validation(format!(
            "invalid account handle: {handle:?}"
        )));
    }
    Ok(())
}
