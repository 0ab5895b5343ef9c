//! One settlement transaction for one transfer intent.

use tracing::{debug, instrument};

use payflow_core::transfer::wire_now;
use payflow_core::{Account, LedgerError, LedgerResult, TransactionId, TransferLegs, ValidatedIntent};

use crate::store::{CasOutcome, InsertOutcome, LedgerStore, LedgerTx};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// Both legs were recorded by this call.
    Committed(TransferLegs),
    /// The transfer id was already in the ledger; nothing was changed.
    AlreadySettled,
}

/// Debits the sender, credits the recipient and records both legs in one
/// store transaction.
///
/// Settling is idempotent on the transfer id: a transfer whose legs are
/// already recorded is reported as [`SettlementOutcome::AlreadySettled`]
/// and leaves balances untouched. Sufficiency is re-checked against the
/// balance read inside the transaction, so a stale initiator snapshot can
/// never drive the sender negative.
#[derive(Debug, Clone)]
pub struct Settler<S> {
    store: S,
}

impl<S: LedgerStore> Settler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    #[instrument(skip(self, intent), fields(transfer_id = %intent.transfer_id), err)]
    pub async fn settle(&self, intent: &ValidatedIntent) -> LedgerResult<SettlementOutcome> {
        let id = intent.transfer_id;
        let mut tx = self.store.begin().await?;

        if tx.is_recorded(id).await? {
            tx.rollback().await?;
            debug!("transfer already recorded");
            return Ok(SettlementOutcome::AlreadySettled);
        }

        let sender = tx
            .account_by_handle(&intent.sender_handle)
            .await?
            .ok_or_else(|| {
                LedgerError::account_not_found(format!(
                    "sender {} does not exist",
                    intent.sender_handle
                ))
                .with_handle(intent.sender_handle.clone())
                .with_transfer(id)
            })?;
        let recipient = tx.account_by_id(intent.recipient_id).await?.ok_or_else(|| {
            LedgerError::account_not_found(format!("recipient {} does not exist", intent.recipient_id))
                .with_account(intent.recipient_id)
                .with_transfer(id)
        })?;

        let legs = TransferLegs::settle(
            id,
            &sender,
            &recipient,
            intent.amount,
            intent.remarks.clone(),
            intent.created_at,
        )?;

        swap(&mut tx, &sender, legs.debit().balance_after, id).await?;
        swap(&mut tx, &recipient, legs.credit().balance_after, id).await?;

        if tx.record_transfer(&legs).await? == InsertOutcome::Duplicate {
            tx.rollback().await?;
            debug!("transfer recorded concurrently; rolled back");
            return Ok(SettlementOutcome::AlreadySettled);
        }

        tx.commit().await.map_err(|e| LedgerError::from(e).with_transfer(id))?;
        Ok(SettlementOutcome::Committed(legs))
    }
}

async fn swap<T: LedgerTx>(
    tx: &mut T,
    account: &Account,
    new_balance: i64,
    transfer_id: TransactionId,
) -> LedgerResult<Account> {
    match tx
        .compare_and_swap(account.id, account.expected_version(), new_balance, wire_now())
        .await?
    {
        CasOutcome::Applied(updated) => Ok(updated),
        CasOutcome::NotFound => Err(LedgerError::account_not_found(format!(
            "account {} disappeared during settlement",
            account.id
        ))
        .with_account(account.id)
        .with_transfer(transfer_id)),
        CasOutcome::Conflict { actual } => Err(LedgerError::conflict(format!(
            "account {} is at version {actual}, expected {}",
            account.id, account.version
        ))
        .with_account(account.id)
        .with_transfer(transfer_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payflow_core::{AccountId, Amount, ErrorKind};

    use crate::store::InMemoryLedgerStore;

    async fn setup(sender_balance: i64) -> (Settler<InMemoryLedgerStore>, Account, Account) {
        let store = InMemoryLedgerStore::new();
        let alice = Account {
            balance: sender_balance,
            ..Account::open("0811", wire_now()).unwrap()
        };
        let bob = Account::open("0822", wire_now()).unwrap();
        store.insert_account(&alice).await.unwrap();
        store.insert_account(&bob).await.unwrap();
        (Settler::new(store), alice, bob)
    }

    fn intent(recipient: AccountId, amount: i64) -> ValidatedIntent {
        ValidatedIntent {
            transfer_id: TransactionId::new(),
            amount: Amount::new(amount).unwrap(),
            sender_handle: "0811".to_string(),
            recipient_id: recipient,
            remarks: None,
            created_at: wire_now(),
        }
    }

    #[tokio::test]
    async fn settles_both_legs_once() {
        let (settler, alice, bob) = setup(100).await;
        let intent = intent(bob.id, 30);

        let first = settler.settle(&intent).await.unwrap();
        let SettlementOutcome::Committed(legs) = first else {
            panic!("expected a committed settlement");
        };
        assert_eq!(legs.totals().0, legs.totals().1);

        assert_eq!(settler.settle(&intent).await.unwrap(), SettlementOutcome::AlreadySettled);

        let store = settler.store();
        let alice = store.account_by_id(alice.id).await.unwrap().unwrap();
        let bob = store.account_by_id(bob.id).await.unwrap().unwrap();
        assert_eq!((alice.balance, alice.version), (70, 2));
        assert_eq!((bob.balance, bob.version), (30, 2));
        assert_eq!(store.entries_for_transaction(intent.transfer_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rechecks_sufficiency_at_settlement() {
        let (settler, alice, bob) = setup(20).await;
        let err = settler.settle(&intent(bob.id, 30)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert!(err.transfer_id().is_some());

        let alice = settler.store().account_by_id(alice.id).await.unwrap().unwrap();
        assert_eq!((alice.balance, alice.version), (20, 1));
        assert_eq!(settler.store().entry_count(), 0);
    }

    #[tokio::test]
    async fn unknown_recipient_is_not_found() {
        let (settler, _, _) = setup(20).await;
        let err = settler.settle(&intent(AccountId::new(), 5)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccountNotFound);
    }

    #[tokio::test]
    async fn failed_commit_is_transient_and_changes_nothing() {
        let (settler, alice, bob) = setup(50).await;
        settler.store().fail_next_commits(1);
        let intent = intent(bob.id, 10);

        let err = settler.settle(&intent).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientStoreError);
        assert_eq!(err.transfer_id(), Some(intent.transfer_id));
        assert_eq!(settler.store().entry_count(), 0);

        assert!(matches!(
            settler.settle(&intent).await.unwrap(),
            SettlementOutcome::Committed(_)
        ));
        let alice = settler.store().account_by_id(alice.id).await.unwrap().unwrap();
        assert_eq!(alice.balance, 40);
    }
}
