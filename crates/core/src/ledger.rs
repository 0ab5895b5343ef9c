//! Ledger entries and the double-entry transfer pair.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::Account;
use crate::amount::Amount;
use crate::error::{LedgerError, LedgerResult};
use crate::id::{AccountId, TransactionId};

/// Version tag stamped on every ledger row.
pub const LEDGER_ENTRY_VERSION: i32 = 1;

/// Direction of a balance change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    Credit,
    Debit,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Credit => "CREDIT",
            EntryType::Debit => "DEBIT",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            EntryType::Credit => EntryType::Debit,
            EntryType::Debit => EntryType::Credit,
        }
    }
}

impl core::fmt::Display for EntryType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREDIT" => Ok(EntryType::Credit),
            "DEBIT" => Ok(EntryType::Debit),
            other => Err(LedgerError::validation(format!("unknown entry type: {other}"))),
        }
    }
}

/// Immutable record of one account's balance change.
///
/// `(id, entry_type)` is unique in the ledger. Top-ups and payments own a
/// single row; a transfer owns one DEBIT and one CREDIT row under the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: TransactionId,
    pub account_id: AccountId,
    pub counterparty_account_id: Option<AccountId>,
    pub entry_type: EntryType,
    pub amount: Amount,
    pub balance_before: i64,
    pub balance_after: i64,
    pub remarks: Option<String>,
    pub created_at: DateTime<Utc>,
    pub version: i32,
}

impl LedgerEntry {
    /// Entry describing `amount` applied to `account` in `entry_type`.
    ///
    /// Fails exactly like [`Account::apply`] (e.g. insufficient funds).
    pub fn for_mutation(
        id: TransactionId,
        account: &Account,
        entry_type: EntryType,
        amount: Amount,
        remarks: Option<String>,
        created_at: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        let balance_after = account.apply(entry_type, amount)?;
        Ok(Self {
            id,
            account_id: account.id,
            counterparty_account_id: None,
            entry_type,
            amount,
            balance_before: account.balance,
            balance_after,
            remarks,
            created_at,
            version: LEDGER_ENTRY_VERSION,
        })
    }

    pub fn with_counterparty(mut self, counterparty: AccountId) -> Self {
        self.counterparty_account_id = Some(counterparty);
        self
    }

    /// Signed effect on the owning account's balance.
    pub fn signed_amount(&self) -> i64 {
        match self.entry_type {
            EntryType::Credit => self.amount.get(),
            EntryType::Debit => -self.amount.get(),
        }
    }

    /// `balance_after = balance_before ± amount`, never negative.
    pub fn verify(&self) -> LedgerResult<()> {
        if self.balance_before.checked_add(self.signed_amount()) != Some(self.balance_after) {
            return Err(LedgerError::store_failure(format!(
                "ledger entry {} ({}) is inconsistent: {} -> {} for {}",
                self.id, self.entry_type, self.balance_before, self.balance_after, self.amount
            ))
            .with_transfer(self.id));
        }
        if self.balance_after < 0 {
            return Err(LedgerError::store_failure(format!(
                "ledger entry {} drives balance negative",
                self.id
            ))
            .with_transfer(self.id));
        }
        Ok(())
    }
}

/// The two legs of a settled transfer.
///
/// Both legs share the transfer id and amount, the DEBIT is on the sender and
/// the CREDIT on the recipient, and each names the other side as counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLegs {
    debit: LedgerEntry,
    credit: LedgerEntry,
}

impl TransferLegs {
    /// Compute both legs for moving `amount` from `sender` to `recipient`.
    pub fn settle(
        id: TransactionId,
        sender: &Account,
        recipient: &Account,
        amount: Amount,
        remarks: Option<String>,
        created_at: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        if sender.id == recipient.id {
            return Err(LedgerError::validation("sender and recipient are the same account")
                .with_account(sender.id)
                .with_transfer(id));
        }

        let debit = LedgerEntry::for_mutation(
            id,
            sender,
            EntryType::Debit,
            amount,
            remarks.clone(),
            created_at,
        )
        .map_err(|e| e.with_transfer(id))?
        .with_counterparty(recipient.id);

        let credit =
            LedgerEntry::for_mutation(id, recipient, EntryType::Credit, amount, remarks, created_at)
                .map_err(|e| e.with_transfer(id))?
                .with_counterparty(sender.id);

        Self::new(debit, credit)
    }

    /// Pair two existing entries, checking they form one transfer.
    pub fn new(debit: LedgerEntry, credit: LedgerEntry) -> LedgerResult<Self> {
        let id = debit.id;
        let fail = |msg: &str| -> LedgerResult<Self> {
            Err(LedgerError::store_failure(msg.to_string()).with_transfer(id))
        };

        if debit.entry_type != EntryType::Debit || credit.entry_type != EntryType::Credit {
            return fail("transfer legs must be one DEBIT and one CREDIT");
        }
        if debit.id != credit.id {
            return fail("transfer legs reference different ids");
        }
        if debit.amount != credit.amount {
            return fail("transfer legs carry different amounts");
        }
        if debit.counterparty_account_id != Some(credit.account_id)
            || credit.counterparty_account_id != Some(debit.account_id)
        {
            return fail("transfer legs do not reference each other");
        }
        debit.verify()?;
        credit.verify()?;

        Ok(Self { debit, credit })
    }

    pub fn id(&self) -> TransactionId {
        self.debit.id
    }

    pub fn debit(&self) -> &LedgerEntry {
        &self.debit
    }

    pub fn credit(&self) -> &LedgerEntry {
        &self.credit
    }

    pub fn amount(&self) -> Amount {
        self.debit.amount
    }

    /// Sum of both accounts' balances before and after; always equal.
    pub fn totals(&self) -> (i64, i64) {
        (
            self.debit.balance_before + self.credit.balance_before,
            self.debit.balance_after + self.credit.balance_after,
        )
    }

    pub fn into_entries(self) -> [LedgerEntry; 2] {
        [self.debit, self.credit]
    }
}
