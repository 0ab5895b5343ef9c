//! Transfer Initiator: synchronous validation, then publication of a
//! [`TransferIntent`] for asynchronous settlement.
//!
//! The balance check here reads a snapshot outside any transaction and holds
//! no lock; it only rejects transfers that are obviously unaffordable. The
//! settlement worker re-validates under its own transaction.

use tracing::{info, instrument, warn};

use payflow_core::amount::validate_remarks;
use payflow_core::transfer::{format_created_at, wire_now};
use payflow_core::{
    AccountId, Amount, EntryType, ErrorKind, LedgerError, LedgerResult, TransactionId,
    TransferIntent, TransferReceipt,
};
use payflow_events::EventBus;

use crate::retry::RetryPolicy;
use crate::store::LedgerStore;

#[derive(Debug, Clone)]
pub struct TransferInitiator<S, B> {
    store: S,
    bus: B,
    publish_retry: RetryPolicy,
}

impl<S, B> TransferInitiator<S, B>
where
    S: LedgerStore,
    B: EventBus<Vec<u8>>,
{
    pub fn new(store: S, bus: B, publish_retry: RetryPolicy) -> Self {
        Self {
            store,
            bus,
            publish_retry,
        }
    }

    /// Validate a transfer request and publish it.
    ///
    /// The receipt's balances come from the pre-settlement snapshot. Publish
    /// errors are retried under the publish policy; once it is exhausted the
    /// caller gets `PublishFailed` and nothing was queued.
    #[instrument(
        skip(self, remarks),
        fields(sender = %sender_handle, recipient = %recipient_id, amount = %amount),
        err
    )]
    pub async fn initiate(
        &self,
        sender_handle: &str,
        recipient_id: &str,
        amount: Amount,
        remarks: Option<String>,
    ) -> LedgerResult<TransferReceipt> {
        let remarks = validate_remarks(remarks)?;

        let sender = self
            .store
            .account_by_handle(sender_handle)
            .await?
            .ok_or_else(|| {
                LedgerError::account_not_found(format!("no account with handle {sender_handle}"))
                    .with_handle(sender_handle)
            })?;
        let snapshot_after = sender.apply(EntryType::Debit, amount)?;

        let recipient_id = recipient_id.parse::<AccountId>().map_err(|e| {
            LedgerError::account_not_found(format!("recipient: {}", e.message()))
        })?;
        let recipient = self
            .store
            .account_by_id(recipient_id)
            .await?
            .ok_or_else(|| {
                LedgerError::account_not_found(format!("no recipient account {recipient_id}"))
                    .with_account(recipient_id)
            })?;
        if recipient.id == sender.id {
            return Err(LedgerError::validation("cannot transfer to the same account")
                .with_handle(sender_handle)
                .with_account(sender.id));
        }

        let transfer_id = TransactionId::new();
        let created_at = wire_now();
        let intent = TransferIntent::new(
            transfer_id,
            amount,
            sender.handle.clone(),
            recipient.id,
            remarks.clone(),
            created_at,
        );
        let payload = intent.encode()?;

        self.publish(intent.partition_key(), transfer_id, payload).await?;

        info!(%transfer_id, "transfer intent published");
        Ok(TransferReceipt {
            transfer_id,
            balance_before: sender.balance,
            balance_after: snapshot_after,
            target_transfer: recipient.id,
            amount,
            remarks,
            created_at: format_created_at(created_at),
        })
    }

    async fn publish(
        &self,
        key: &str,
        transfer_id: TransactionId,
        payload: Vec<u8>,
    ) -> LedgerResult<()> {
        self.publish_retry
            .run("publish_transfer_intent", |_| {
                let payload = payload.clone();
                async move {
                    self.bus.publish(key, payload).await.map_err(|e| {
                        LedgerError::new(ErrorKind::TransientBusError, e.to_string())
                            .with_transfer(transfer_id)
                    })
                }
            })
            .await
            .map_err(|e| {
                warn!(%transfer_id, error = %e, "giving up on publishing transfer intent");
                LedgerError::new(
                    ErrorKind::PublishFailed,
                    format!("transfer intent not published: {}", e.message()),
                )
                .with_handle(key)
                .with_transfer(transfer_id)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use payflow_core::Account;
    use payflow_events::{Consumer, InMemoryEventBus};

    use crate::store::InMemoryLedgerStore;

    /// Bus that fails its first `failures` publishes.
    #[derive(Debug, Default)]
    struct FlakyBus {
        failures: u32,
        calls: AtomicU32,
        inner: InMemoryEventBus<Vec<u8>>,
    }

    #[async_trait]
    impl EventBus<Vec<u8>> for FlakyBus {
        type Error = String;

        async fn publish(&self, key: &str, message: Vec<u8>) -> Result<(), Self::Error> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err("broker unavailable".to_string());
            }
            self.inner
                .publish(key, message)
                .await
                .map_err(|e| e.to_string())
        }
    }

    async fn seed(store: &InMemoryLedgerStore, handle: &str, balance: i64) -> Account {
        let account = Account {
            balance,
            ..Account::open(handle, wire_now()).unwrap()
        };
        store.insert_account(&account).await.unwrap();
        account
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::fixed(2, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn publishes_intent_keyed_by_sender() {
        let store = InMemoryLedgerStore::new();
        let bus = Arc::new(InMemoryEventBus::<Vec<u8>>::new());
        seed(&store, "0811", 100).await;
        let bob = seed(&store, "0822", 0).await;

        let initiator = TransferInitiator::new(store.clone(), bus.clone(), policy());
        let receipt = initiator
            .initiate("0811", &bob.id.to_string(), Amount::new(30).unwrap(), Some("rent".into()))
            .await
            .unwrap();

        assert_eq!(receipt.balance_before, 100);
        assert_eq!(receipt.balance_after, 70);
        assert_eq!(receipt.target_transfer, bob.id);

        let delivery = bus.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(delivery.key(), "0811");
        let intent = TransferIntent::decode(delivery.payload()).unwrap();
        assert_eq!(intent.transaction_id, receipt.transfer_id);
        assert_eq!(intent.created_at, receipt.created_at);
        assert_eq!(intent.remarks, "rent");

        // Nothing settles until the worker runs.
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn rejects_before_publishing() {
        let store = InMemoryLedgerStore::new();
        let bus = Arc::new(InMemoryEventBus::<Vec<u8>>::new());
        let alice = seed(&store, "0811", 10).await;
        let bob = seed(&store, "0822", 0).await;
        let initiator = TransferInitiator::new(store, bus.clone(), policy());

        let cases = [
            ("0899", bob.id.to_string(), 5, ErrorKind::AccountNotFound),
            ("0811", "garbage".to_string(), 5, ErrorKind::AccountNotFound),
            ("0811", AccountId::new().to_string(), 5, ErrorKind::AccountNotFound),
            ("0811", bob.id.to_string(), 11, ErrorKind::InsufficientFunds),
            ("0811", alice.id.to_string(), 5, ErrorKind::Validation),
        ];
        for (sender, recipient, amount, kind) in cases {
            let err = initiator
                .initiate(sender, &recipient, Amount::new(amount).unwrap(), None)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), kind, "{sender} -> {recipient} ({amount})");
        }
        assert_eq!(bus.published(), 0);
    }

    #[tokio::test]
    async fn transient_publish_errors_are_retried() {
        let store = InMemoryLedgerStore::new();
        seed(&store, "0811", 10).await;
        let bob = seed(&store, "0822", 0).await;
        let bus = FlakyBus {
            failures: 2,
            ..Default::default()
        };
        let initiator = TransferInitiator::new(store, bus, policy());

        initiator
            .initiate("0811", &bob.id.to_string(), Amount::new(5).unwrap(), None)
            .await
            .unwrap();
        assert_eq!(initiator.bus.calls.load(Ordering::SeqCst), 3);
        assert_eq!(initiator.bus.inner.published(), 1);
    }

    #[tokio::test]
    async fn exhausted_publish_retries_report_publish_failed() {
        let store = InMemoryLedgerStore::new();
        seed(&store, "0811", 10).await;
        let bob = seed(&store, "0822", 0).await;
        let bus = FlakyBus {
            failures: u32::MAX,
            ..Default::default()
        };
        let initiator = TransferInitiator::new(store, bus, policy());

        let err = initiator
            .initiate("0811", &bob.id.to_string(), Amount::new(5).unwrap(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PublishFailed);
        assert!(err.transfer_id().is_some());
        assert_eq!(initiator.bus.inner.published(), 0);
    }
}
