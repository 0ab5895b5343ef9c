//! Integration tests for the full ledger pipeline.
//!
//! Tests: Engine → Store, Initiator → Bus → Settlement Worker → Store
//!
//! Verifies:
//! - Mutations and settlements keep balances and ledger rows consistent
//! - Redelivered transfer intents settle exactly once
//! - Concurrent writers are serialized by the version compare-and-swap
//! - Balances never go negative, whatever the interleaving

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;

    use payflow_core::transfer::wire_now;
    use payflow_core::{Account, Amount, EntryType, ErrorKind, TransferIntent};
    use payflow_events::{Consumer, EventBus, InMemoryEventBus};

    use crate::config::PayflowConfig;
    use crate::context::LedgerContext;
    use crate::dead_letter::InMemoryDeadLetterSink;
    use crate::retry::RetryPolicy;
    use crate::settlement::{SettlementState, SettlementWorker};
    use crate::store::{InMemoryLedgerStore, LedgerStore};

    type Bus = InMemoryEventBus<Vec<u8>>;
    type Ctx = LedgerContext<InMemoryLedgerStore, Bus>;

    fn config() -> PayflowConfig {
        let mut config = PayflowConfig::default();
        config.mutation.retry = RetryPolicy::fixed(200, Duration::from_millis(1));
        config.mutation.publish_retry = RetryPolicy::fixed(2, Duration::from_millis(1));
        config.settlement.retry = RetryPolicy::fixed(50, Duration::from_millis(1));
        config.settlement.poll_timeout_ms = 10;
        config.settlement.concurrency = 8;
        config
    }

    fn setup() -> Ctx {
        LedgerContext::new(InMemoryLedgerStore::new(), Arc::new(Bus::new()), config())
    }

    async fn open_with(ctx: &Ctx, handle: &str, balance: i64) -> Account {
        let account = ctx.accounts().open(handle).await.unwrap();
        if balance > 0 {
            ctx.engine()
                .top_up(handle, Amount::new(balance).unwrap(), Some("seed".into()))
                .await
                .unwrap();
        }
        ctx.accounts().by_id(&account.id.to_string()).await.unwrap()
    }

    fn worker(
        ctx: &Ctx,
    ) -> (
        SettlementWorker<InMemoryLedgerStore, Arc<Bus>, Arc<InMemoryDeadLetterSink>>,
        Arc<InMemoryDeadLetterSink>,
    ) {
        let sink = Arc::new(InMemoryDeadLetterSink::new());
        (ctx.settlement_worker(sink.clone()), sink)
    }

    async fn next_delivery(ctx: &Ctx) -> payflow_events::Delivery<Vec<u8>> {
        ctx.bus()
            .poll(Duration::from_millis(100))
            .await
            .unwrap()
            .expect("a delivery")
    }

    #[tokio::test]
    async fn top_up_scenario() {
        let ctx = setup();
        let a = open_with(&ctx, "0811", 100).await;
        assert_eq!((a.balance, a.version), (100, 2));

        let receipt = ctx
            .engine()
            .top_up("0811", Amount::new(50).unwrap(), None)
            .await
            .unwrap();
        let a = ctx.accounts().by_handle("0811").await.unwrap();
        assert_eq!((a.balance, a.version), (150, 3));

        let entries = ctx.store().entries_for_transaction(receipt.top_up_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, EntryType::Credit);
        assert_eq!(entries[0].balance_before, 100);
        assert_eq!(entries[0].balance_after, 150);
    }

    #[tokio::test]
    async fn overdrawn_payment_scenario() {
        let ctx = setup();
        open_with(&ctx, "0811", 100).await;

        let err = ctx
            .engine()
            .payment("0811", Amount::new(150).unwrap(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(err.kind().http_status(), 422);

        let a = ctx.accounts().by_handle("0811").await.unwrap();
        assert_eq!((a.balance, a.version), (100, 2));
        assert_eq!(ctx.accounts().statement("0811").await.unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn transfer_settles_both_legs_and_conserves_money() {
        let ctx = setup();
        let alice = open_with(&ctx, "0811", 100).await;
        let bob = open_with(&ctx, "0822", 5).await;
        let (worker, sink) = worker(&ctx);

        let receipt = ctx
            .initiator()
            .initiate("0811", &bob.id.to_string(), Amount::new(30).unwrap(), Some("rent".into()))
            .await
            .unwrap();
        assert_eq!((receipt.balance_before, receipt.balance_after), (100, 70));

        let state = worker.handle_delivery(next_delivery(&ctx).await).await;
        assert_eq!(state, SettlementState::Committed);
        assert!(sink.is_empty());

        let alice_now = ctx.accounts().by_handle("0811").await.unwrap();
        let bob_now = ctx.accounts().by_handle("0822").await.unwrap();
        assert_eq!(alice.balance + bob.balance, alice_now.balance + bob_now.balance);
        assert_eq!((alice_now.balance, alice_now.version), (70, alice.version + 1));
        assert_eq!((bob_now.balance, bob_now.version), (35, bob.version + 1));

        let legs = ctx.store().entries_for_transaction(receipt.transfer_id).await.unwrap();
        assert_eq!(legs.len(), 2);
        let debit = legs.iter().find(|e| e.entry_type == EntryType::Debit).unwrap();
        let credit = legs.iter().find(|e| e.entry_type == EntryType::Credit).unwrap();
        assert_eq!(debit.account_id, alice.id);
        assert_eq!(debit.counterparty_account_id, Some(bob.id));
        assert_eq!(credit.account_id, bob.id);
        assert_eq!(credit.remarks.as_deref(), Some("rent"));
    }

    #[tokio::test]
    async fn overdraft_race_fails_cleanly_at_settlement() {
        let ctx = setup();
        open_with(&ctx, "0811", 100).await;
        let bob = open_with(&ctx, "0822", 0).await;
        let (worker, sink) = worker(&ctx);

        // Snapshot check passes...
        let receipt = ctx
            .initiator()
            .initiate("0811", &bob.id.to_string(), Amount::new(30).unwrap(), None)
            .await
            .unwrap();
        // ...then a payment lands before settlement runs.
        ctx.engine()
            .payment("0811", Amount::new(90).unwrap(), None)
            .await
            .unwrap();

        let state = worker.handle_delivery(next_delivery(&ctx).await).await;
        assert_eq!(state, SettlementState::PermanentFailure);

        let letters = sink.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].kind, ErrorKind::InsufficientFunds);
        assert_eq!(letters[0].transfer_id, Some(receipt.transfer_id));
        assert_eq!(ctx.bus().acked(), 1);

        assert_eq!(ctx.accounts().by_handle("0811").await.unwrap().balance, 10);
        assert_eq!(ctx.accounts().by_handle("0822").await.unwrap().balance, 0);
        assert!(ctx
            .store()
            .entries_for_transaction(receipt.transfer_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn redelivery_after_crash_settles_once() {
        let ctx = setup();
        open_with(&ctx, "0811", 100).await;
        let bob = open_with(&ctx, "0822", 0).await;
        let (worker, _sink) = worker(&ctx);

        let receipt = ctx
            .initiator()
            .initiate("0811", &bob.id.to_string(), Amount::new(30).unwrap(), None)
            .await
            .unwrap();

        // Settle, then "crash" before the ack.
        let first = next_delivery(&ctx).await;
        let intent = TransferIntent::decode(first.payload()).unwrap().validate().unwrap();
        ctx.settler().settle(&intent).await.unwrap();
        assert_eq!(ctx.bus().redeliver_unacked(), 1);

        let again = next_delivery(&ctx).await;
        assert!(again.is_redelivery());
        assert_eq!(worker.handle_delivery(again).await, SettlementState::Committed);
        assert_eq!(worker.stats().duplicates, 1);
        assert_eq!(worker.stats().committed, 0);

        let alice = ctx.accounts().by_handle("0811").await.unwrap();
        assert_eq!(alice.balance, 70);
        assert_eq!(
            ctx.store().entries_for_transaction(receipt.transfer_id).await.unwrap().len(),
            2
        );
        assert_eq!(ctx.bus().pending() + ctx.bus().in_flight(), 0);
    }

    #[tokio::test]
    async fn duplicate_publication_is_harmless() {
        let ctx = setup();
        open_with(&ctx, "0811", 100).await;
        let bob = open_with(&ctx, "0822", 0).await;
        let (worker, _sink) = worker(&ctx);

        ctx.initiator()
            .initiate("0811", &bob.id.to_string(), Amount::new(40).unwrap(), None)
            .await
            .unwrap();
        let original = next_delivery(&ctx).await;
        ctx.bus()
            .publish(original.key(), original.payload().clone())
            .await
            .unwrap();

        worker.handle_delivery(original).await;
        worker.handle_delivery(next_delivery(&ctx).await).await;

        assert_eq!(ctx.accounts().by_handle("0811").await.unwrap().balance, 60);
        assert_eq!(ctx.accounts().by_handle("0822").await.unwrap().balance, 40);
        assert_eq!(worker.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn unparsable_created_at_is_dead_lettered() {
        let ctx = setup();
        open_with(&ctx, "0811", 100).await;
        let bob = open_with(&ctx, "0822", 0).await;
        let (worker, sink) = worker(&ctx);

        let mut intent = TransferIntent::new(
            payflow_core::TransactionId::new(),
            Amount::new(10).unwrap(),
            "0811",
            bob.id,
            None,
            wire_now(),
        );
        intent.created_at = "2024-05-01T10:11:12Z".to_string();
        ctx.bus()
            .publish("0811", intent.encode().unwrap())
            .await
            .unwrap();

        let state = worker.handle_delivery(next_delivery(&ctx).await).await;
        assert_eq!(state, SettlementState::PermanentFailure);
        assert_eq!(sink.letters()[0].kind, ErrorKind::MalformedMessage);
        assert_eq!(sink.letters()[0].transfer_id, Some(intent.transaction_id));
        assert_eq!(ctx.accounts().by_handle("0811").await.unwrap().balance, 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_top_ups_both_land() {
        let ctx = setup();
        let before = open_with(&ctx, "0811", 100).await;

        let (e1, e2) = (ctx.engine(), ctx.engine());
        let t1 = tokio::spawn(async move { e1.top_up("0811", Amount::new(7).unwrap(), None).await });
        let t2 = tokio::spawn(async move { e2.top_up("0811", Amount::new(11).unwrap(), None).await });
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();

        let after = ctx.accounts().by_handle("0811").await.unwrap();
        assert_eq!(after.balance, before.balance + 7 + 11);
        assert_eq!(after.version, before.version + 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_payments_never_overdraw() {
        let ctx = setup();
        open_with(&ctx, "0811", 100).await;

        let mut tasks = Vec::new();
        for _ in 0..30 {
            let engine = ctx.engine();
            tasks.push(tokio::spawn(async move {
                engine.payment("0811", Amount::new(10).unwrap(), None).await
            }));
        }

        let mut paid = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => paid += 1,
                Err(e) => assert!(
                    matches!(
                        e.kind(),
                        ErrorKind::InsufficientFunds | ErrorKind::OptimisticLockConflict
                    ),
                    "unexpected error {e}"
                ),
            }
        }

        let account = ctx.accounts().by_handle("0811").await.unwrap();
        assert!(account.balance >= 0);
        assert_eq!(account.balance, 100 - 10 * paid);
        // One seed top-up plus one entry per successful payment.
        let statement = ctx.accounts().statement("0811").await.unwrap();
        assert_eq!(statement.entries.len() as i64, 1 + paid);
        assert_eq!(statement.net_movement(), account.balance);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_settles_many_senders_and_conserves_total() {
        let ctx = setup();
        let handles = ["0811", "0822", "0833", "0844"];
        let mut accounts = Vec::new();
        for h in handles {
            accounts.push(open_with(&ctx, h, 50).await);
        }

        let mut published = 0;
        for round in 0..10 {
            for (i, sender) in handles.iter().enumerate() {
                let recipient = &accounts[(i + round + 1) % handles.len()];
                if recipient.handle == *sender {
                    continue;
                }
                if ctx
                    .initiator()
                    .initiate(sender, &recipient.id.to_string(), Amount::new(3).unwrap(), None)
                    .await
                    .is_ok()
                {
                    published += 1;
                }
            }
        }

        let (worker, sink) = worker(&ctx);
        let handle = worker.spawn();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while ctx.bus().acked() < published && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stats = handle.shutdown().await;

        assert_eq!(stats.received, published);
        assert_eq!(stats.committed + stats.permanent_failures, published);
        assert_eq!(stats.permanent_failures as usize, sink.len());
        // Only a genuine shortfall may dead-letter; never an exhausted retry.
        for letter in sink.letters() {
            assert_eq!(letter.kind, ErrorKind::InsufficientFunds, "{}", letter.reason);
        }
        assert_eq!(stats.dead_lettered, stats.permanent_failures);

        let mut total = 0;
        for h in handles {
            let account = ctx.accounts().by_handle(h).await.unwrap();
            assert!(account.balance >= 0);
            total += account.balance;
        }
        assert_eq!(total, 50 * handles.len() as i64);
    }

    #[tokio::test]
    async fn publish_failure_does_not_queue_anything() {
        #[derive(Debug)]
        struct DownBus;

        #[async_trait::async_trait]
        impl EventBus<Vec<u8>> for DownBus {
            type Error = String;

            async fn publish(&self, _key: &str, _message: Vec<u8>) -> Result<(), Self::Error> {
                Err("connection refused".to_string())
            }
        }

        let store = InMemoryLedgerStore::new();
        let ctx = LedgerContext::new(store.clone(), Arc::new(DownBus), config());
        ctx.accounts().open("0811").await.unwrap();
        ctx.engine()
            .top_up("0811", Amount::new(10).unwrap(), None)
            .await
            .unwrap();
        let bob = ctx.accounts().open("0822").await.unwrap();

        let err = ctx
            .initiator()
            .initiate("0811", &bob.id.to_string(), Amount::new(5).unwrap(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PublishFailed);
        assert_eq!(err.kind().http_status(), 503);
        assert_eq!(ctx.accounts().by_handle("0811").await.unwrap().balance, 10);
    }

    #[derive(Debug, Clone)]
    enum Op {
        TopUp(i64),
        Pay(i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..500).prop_map(Op::TopUp),
            (1i64..500).prop_map(Op::Pay),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn version_moves_by_one_per_committed_mutation(ops in prop::collection::vec(op(), 1..30)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let ctx = setup();
                let opened = ctx.accounts().open("0811").await.unwrap();
                let engine = ctx.engine();
                let (mut balance, mut version) = (opened.balance, opened.version);

                for op in ops {
                    let result = match op {
                        Op::TopUp(n) => engine.top_up("0811", Amount::new(n).unwrap(), None).await.map(|r| r.balance_after),
                        Op::Pay(n) => engine.payment("0811", Amount::new(n).unwrap(), None).await.map(|r| r.balance_after),
                    };
                    match (op, result) {
                        (Op::TopUp(n), Ok(after)) => {
                            balance += n;
                            version += 1;
                            prop_assert_eq!(after, balance);
                        }
                        (Op::Pay(n), Ok(after)) => {
                            prop_assert!(n <= balance);
                            balance -= n;
                            version += 1;
                            prop_assert_eq!(after, balance);
                        }
                        (Op::Pay(n), Err(e)) => {
                            prop_assert!(n > balance);
                            prop_assert_eq!(e.kind(), ErrorKind::InsufficientFunds);
                        }
                        (Op::TopUp(_), Err(e)) => prop_assert!(false, "top-up failed: {}", e),
                    }

                    let stored = ctx.accounts().by_handle("0811").await.unwrap();
                    prop_assert_eq!(stored.version, version);
                    prop_assert_eq!(stored.balance, balance);
                }
                Ok(())
            })?;
        }
    }
}
