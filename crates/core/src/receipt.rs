//! Result DTOs returned to synchronous callers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::account::Account;
use crate::amount::Amount;
use crate::id::{AccountId, TransactionId};
use crate::ledger::LedgerEntry;

/// Outcome of one committed balance mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationOutcome {
    /// Account row as committed (new balance, bumped version).
    pub account: Account,
    pub balance_before: i64,
    pub entry: LedgerEntry,
    pub created_at: DateTime<Utc>,
}

impl MutationOutcome {
    pub fn ledger_id(&self) -> TransactionId {
        self.entry.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopUpReceipt {
    pub top_up_id: TransactionId,
    pub balance_before: i64,
    pub balance_after: i64,
    pub amount: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<MutationOutcome> for TopUpReceipt {
    fn from(o: MutationOutcome) -> Self {
        Self {
            top_up_id: o.entry.id,
            balance_before: o.balance_before,
            balance_after: o.entry.balance_after,
            amount: o.entry.amount,
            remarks: o.entry.remarks,
            created_at: o.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentReceipt {
    pub payment_id: TransactionId,
    pub balance_before: i64,
    pub balance_after: i64,
    pub amount: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<MutationOutcome> for PaymentReceipt {
    fn from(o: MutationOutcome) -> Self {
        Self {
            payment_id: o.entry.id,
            balance_before: o.balance_before,
            balance_after: o.entry.balance_after,
            amount: o.entry.amount,
            remarks: o.entry.remarks,
            created_at: o.created_at,
        }
    }
}

/// Response for an accepted transfer.
///
/// Balances come from the pre-settlement snapshot: `balance_after` is
/// `balance_before - amount`, not the settled balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReceipt {
    pub transfer_id: TransactionId,
    pub balance_before: i64,
    pub balance_after: i64,
    pub target_transfer: AccountId,
    pub amount: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    /// Wire-formatted publication timestamp, identical to the intent's.
    pub created_at: String,
}
