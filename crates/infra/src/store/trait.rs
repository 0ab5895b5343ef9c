use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use payflow_core::{
    Account, AccountId, ErrorKind, ExpectedVersion, LedgerEntry, LedgerError, TransactionId,
    TransferLegs,
};

/// Storage-level failure.
///
/// Variants are split by what the caller may do about them: `Transient` and
/// `Serialization` are worth re-running the whole transaction for, the rest
/// are not.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection loss, pool exhaustion, server shutting down.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// Deadlock or serialization failure; the transaction was aborted.
    #[error("transaction aborted by concurrent writer: {0}")]
    Serialization(String),

    /// Unique key already present.
    #[error("duplicate key: {0}")]
    Duplicate(String),

    /// CHECK / foreign key / not-null violation.
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// A stored row could not be decoded into the domain model.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Serialization(_))
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        let kind = match &err {
            StoreError::Transient(_) | StoreError::Serialization(_) => ErrorKind::TransientStoreError,
            StoreError::Duplicate(_) => ErrorKind::DuplicateSettlement,
            StoreError::Constraint(_) | StoreError::Corrupt(_) | StoreError::Other(_) => {
                ErrorKind::StoreFailure
            }
        };
        LedgerError::new(kind, err.to_string())
    }
}

/// Result of a compare-and-swap on an account's `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// Row updated; carries the row as written.
    Applied(Account),
    /// No row with that id.
    NotFound,
    /// Row exists at a different version.
    Conflict { actual: u64 },
}

/// Result of an idempotent insert.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The key was already present; nothing was written.
    Duplicate,
}

/// Account store + ledger recorder.
///
/// Snapshot reads on the store itself run outside any transaction. Mutations
/// go through a [`LedgerTx`] obtained from [`LedgerStore::begin`].
#[async_trait]
pub trait LedgerStore: Send + Sync {
    type Tx: LedgerTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Insert a new account row; `Duplicate` when the handle or id is taken.
    async fn insert_account(&self, account: &Account) -> Result<InsertOutcome, StoreError>;

    async fn account_by_handle(&self, handle: &str) -> Result<Option<Account>, StoreError>;

    async fn account_by_id(&self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Ledger rows written under `id` (one for top-up/payment, two for a transfer).
    async fn entries_for_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Ledger rows owned by `account_id`, oldest first.
    async fn entries_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<LedgerEntry>, StoreError>;
}

/// One store transaction.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait LedgerTx: Send {
    async fn account_by_handle(&mut self, handle: &str) -> Result<Option<Account>, StoreError>;

    async fn account_by_id(&mut self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// `UPDATE … SET balance, version = version + 1 WHERE id AND version`.
    ///
    /// When nothing matched, tells a missing row apart from a version
    /// mismatch.
    async fn compare_and_swap(
        &mut self,
        id: AccountId,
        expected: ExpectedVersion,
        new_balance: i64,
        at: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError>;

    /// Insert one ledger row, ignoring an existing `(id, entry_type)`.
    async fn record_entry(&mut self, entry: &LedgerEntry) -> Result<InsertOutcome, StoreError>;

    /// Insert both legs of a transfer. `Duplicate` when the transfer id is
    /// already recorded; a half-recorded pair is a `Constraint` error.
    async fn record_transfer(&mut self, legs: &TransferLegs) -> Result<InsertOutcome, StoreError>;

    /// Whether any ledger row exists under `id`.
    async fn is_recorded(&mut self, id: TransactionId) -> Result<bool, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    type Tx = S::Tx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        (**self).begin().await
    }

    async fn insert_account(&self, account: &Account) -> Result<InsertOutcome, StoreError> {
        (**self).insert_account(account).await
    }

    async fn account_by_handle(&self, handle: &str) -> Result<Option<Account>, StoreError> {
        (**self).account_by_handle(handle).await
    }

    async fn account_by_id(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        (**self).account_by_id(id).await
    }

    async fn entries_for_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        (**self).entries_for_transaction(id).await
    }

    async fn entries_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        (**self).entries_for_account(account_id).await
    }
}
