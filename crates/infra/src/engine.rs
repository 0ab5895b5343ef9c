//! Balance Mutation Engine: synchronous top-up (credit) and payment (debit).
//!
//! One mutation is one store transaction: read the account by handle, compute
//! the next balance, compare-and-swap on `version`, record one ledger entry,
//! commit. A lost swap is an `OptimisticLockConflict`, which the engine's
//! [`RetryPolicy`] re-runs from a fresh read.

use tracing::{debug, info, instrument};

use payflow_core::amount::validate_remarks;
use payflow_core::transfer::wire_now;
use payflow_core::{
    Amount, EntryType, ErrorKind, LedgerEntry, LedgerError, LedgerResult, MutationOutcome,
    PaymentReceipt, TopUpReceipt, TransactionId,
};

use crate::retry::RetryPolicy;
use crate::store::{CasOutcome, InsertOutcome, LedgerStore, LedgerTx};

#[derive(Debug, Clone)]
pub struct BalanceMutationEngine<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S: LedgerStore> BalanceMutationEngine<S> {
    pub fn new(store: S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Credit `amount` to the account behind `handle`.
    pub async fn top_up(
        &self,
        handle: &str,
        amount: Amount,
        remarks: Option<String>,
    ) -> LedgerResult<TopUpReceipt> {
        self.mutate(handle, amount, EntryType::Credit, remarks)
            .await
            .map(TopUpReceipt::from)
    }

    /// Debit `amount` from the account behind `handle`.
    pub async fn payment(
        &self,
        handle: &str,
        amount: Amount,
        remarks: Option<String>,
    ) -> LedgerResult<PaymentReceipt> {
        self.mutate(handle, amount, EntryType::Debit, remarks)
            .await
            .map(PaymentReceipt::from)
    }

    /// Apply one balance change and record it.
    ///
    /// The ledger id is generated once and reused across retries, so a
    /// retried attempt never leaves a second entry behind. A retry whose id is
    /// already recorded (the previous commit landed but its acknowledgement was
    /// lost) returns the recorded outcome instead of applying the change again.
    #[instrument(
        skip(self, remarks),
        fields(handle = %handle, amount = %amount, direction = %direction),
        err
    )]
    pub async fn mutate(
        &self,
        handle: &str,
        amount: Amount,
        direction: EntryType,
        remarks: Option<String>,
    ) -> LedgerResult<MutationOutcome> {
        let remarks = validate_remarks(remarks)?;
        let ledger_id = TransactionId::new();

        let outcome = self
            .retry
            .run("balance_mutation", |attempt| {
                let remarks = remarks.clone();
                async move {
                    if attempt > 0 {
                        debug!(attempt, "re-reading account after failed attempt");
                        if let Some(outcome) = self.recorded(ledger_id, direction).await? {
                            info!(%ledger_id, "previous attempt already committed");
                            return Ok(outcome);
                        }
                    }
                    self.attempt(ledger_id, handle, amount, direction, remarks).await
                }
            })
            .await?;

        info!(
            ledger_id = %outcome.ledger_id(),
            account_id = %outcome.account.id,
            balance_before = outcome.balance_before,
            balance_after = outcome.account.balance,
            version = outcome.account.version,
            "balance mutation committed"
        );
        Ok(outcome)
    }

    /// Outcome of an earlier attempt that committed under `ledger_id`, if any.
    async fn recorded(
        &self,
        ledger_id: TransactionId,
        direction: EntryType,
    ) -> LedgerResult<Option<MutationOutcome>> {
        let Some(entry) = self
            .store
            .entries_for_transaction(ledger_id)
            .await?
            .into_iter()
            .find(|e| e.entry_type == direction)
        else {
            return Ok(None);
        };
        let account = self.store.account_by_id(entry.account_id).await?.ok_or_else(|| {
            LedgerError::account_not_found(format!("no account {}", entry.account_id))
                .with_account(entry.account_id)
        })?;
        Ok(Some(MutationOutcome {
            balance_before: entry.balance_before,
            created_at: entry.created_at,
            account,
            entry,
        }))
    }

    async fn attempt(
        &self,
        ledger_id: TransactionId,
        handle: &str,
        amount: Amount,
        direction: EntryType,
        remarks: Option<String>,
    ) -> LedgerResult<MutationOutcome> {
        let mut tx = self.store.begin().await?;

        let account = tx.account_by_handle(handle).await?.ok_or_else(|| {
            LedgerError::account_not_found(format!("no account with handle {handle}"))
                .with_handle(handle)
        })?;

        let now = wire_now();
        let entry = LedgerEntry::for_mutation(ledger_id, &account, direction, amount, remarks, now)?;

        let updated = match tx
            .compare_and_swap(account.id, account.expected_version(), entry.balance_after, now)
            .await?
        {
            CasOutcome::Applied(updated) => updated,
            CasOutcome::NotFound => {
                return Err(LedgerError::account_not_found(format!(
                    "account {} disappeared during mutation",
                    account.id
                ))
                .with_handle(handle)
                .with_account(account.id));
            }
            CasOutcome::Conflict { actual } => {
                return Err(LedgerError::conflict(format!(
                    "account {} is at version {actual}, expected {}",
                    account.id, account.version
                ))
                .with_handle(handle)
                .with_account(account.id));
            }
        };

        if tx.record_entry(&entry).await? == InsertOutcome::Duplicate {
            return Err(LedgerError::new(
                ErrorKind::DuplicateSettlement,
                format!("ledger id {ledger_id} is already recorded"),
            )
            .with_account(account.id)
            .with_transfer(ledger_id));
        }

        tx.commit().await?;

        Ok(MutationOutcome {
            balance_before: account.balance,
            account: updated,
            entry,
            created_at: now,
        })
    }
}
