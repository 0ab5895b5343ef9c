//! Transfer Settlement Worker.
//!
//! Pulls transfer intents from a [`Consumer`], settles each one on its own
//! task and acknowledges it once it reached a terminal state.
//!
//! - **Bounded concurrency**: a semaphore permit is taken *before* polling,
//!   so a saturated worker stops pulling instead of buffering.
//! - **Transient failures** (lost swaps, connection loss, aborted commits)
//!   are retried in-process under the settlement [`RetryPolicy`].
//! - **Permanent failures** and exhausted retries go to the dead-letter sink;
//!   the delivery is acknowledged only after the sink accepted the letter.
//! - **Shutdown** stops polling and waits for every in-flight handler. A
//!   handler is never cancelled mid-transaction.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use payflow_core::{LedgerError, LedgerResult, TransferIntent, ValidatedIntent};
use payflow_events::{Consumer, Delivery};

use super::settler::{SettlementOutcome, Settler};
use super::state::{SettlementProgress, SettlementState};
use crate::config::SettlementConfig;
use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::retry::RetryPolicy;
use crate::store::LedgerStore;

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub committed: u64,
    /// Deliveries whose transfer was already recorded.
    pub duplicates: u64,
    pub retries: u64,
    pub permanent_failures: u64,
    pub dead_lettered: u64,
    pub ack_failures: u64,
    pub in_flight: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    committed: AtomicU64,
    duplicates: AtomicU64,
    retries: AtomicU64,
    permanent_failures: AtomicU64,
    dead_lettered: AtomicU64,
    ack_failures: AtomicU64,
    in_flight: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            received: self.received.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running worker.
///
/// Dropping the handle also stops the worker, without waiting for it.
#[derive(Debug)]
pub struct SettlementWorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl SettlementWorkerHandle {
    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Stop polling, drain in-flight handlers, and return the final stats.
    pub async fn shutdown(self) -> WorkerStats {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "settlement worker task failed");
        }
        self.counters.snapshot()
    }
}

pub struct SettlementWorker<S, C, D> {
    settler: Settler<S>,
    consumer: C,
    dead_letters: D,
    concurrency: usize,
    poll_timeout: Duration,
    retry: RetryPolicy,
    counters: Arc<Counters>,
}

impl<S, C, D> SettlementWorker<S, C, D>
where
    S: LedgerStore + 'static,
    C: Consumer<Vec<u8>> + 'static,
    D: DeadLetterSink + 'static,
{
    pub fn new(settler: Settler<S>, consumer: C, dead_letters: D, config: &SettlementConfig) -> Self {
        Self {
            settler,
            consumer,
            dead_letters,
            concurrency: config.concurrency.max(1),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            retry: config.retry.clone(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Run the worker on the current Tokio runtime.
    pub fn spawn(self) -> SettlementWorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = self.counters.clone();
        let join = tokio::spawn(Arc::new(self).run(shutdown_rx));
        SettlementWorkerHandle {
            shutdown: shutdown_tx,
            join,
            counters,
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handlers = JoinSet::new();
        info!(concurrency = self.concurrency, "settlement worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Some(joined) = handlers.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "settlement handler panicked");
                }
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.consumer.poll(self.poll_timeout).await {
                Ok(Some(delivery)) => {
                    let worker = Arc::clone(&self);
                    handlers.spawn(async move {
                        worker.handle_delivery(delivery).await;
                        drop(permit);
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "polling the bus failed; backing off");
                    tokio::time::sleep(self.poll_timeout).await;
                }
            }
        }

        info!(in_flight = handlers.len(), "settlement worker draining");
        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "settlement handler panicked");
            }
        }
        info!(stats = ?self.counters.snapshot(), "settlement worker stopped");
    }
}

impl<S, C, D> SettlementWorker<S, C, D>
where
    S: LedgerStore,
    C: Consumer<Vec<u8>>,
    D: DeadLetterSink,
{
    /// Drive one delivery to a terminal state and return that state.
    ///
    /// The delivery is acknowledged unless the dead-letter sink refused a
    /// failed message; in that case it stays outstanding for redelivery.
    pub async fn handle_delivery(&self, delivery: Delivery<Vec<u8>>) -> SettlementState {
        Counters::bump(&self.counters.received);
        self.counters.in_flight.fetch_add(1, Ordering::Relaxed);
        let state = self.process(&delivery).await;
        self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        state
    }

    async fn process(&self, delivery: &Delivery<Vec<u8>>) -> SettlementState {
        let mut progress = SettlementProgress::new(delivery.id());
        if delivery.is_redelivery() {
            debug!(delivery_id = %delivery.id(), "handling redelivered message");
        }

        let intent = match decode(delivery.payload()) {
            Ok(intent) => intent,
            Err(err) => {
                warn!(delivery_id = %delivery.id(), error = %err, "malformed transfer intent");
                progress.advance(SettlementState::PermanentFailure);
                self.dead_letter(delivery, &err, 0).await;
                return progress.state();
            }
        };
        let transfer_id = intent.transfer_id;
        progress.identify(transfer_id);
        progress.advance(SettlementState::Parsed);

        let (outcome, attempts) = self.settle_with_retry(&intent, &mut progress).await;
        match outcome {
            Ok(SettlementOutcome::Committed(legs)) => {
                progress.advance(SettlementState::Committed);
                Counters::bump(&self.counters.committed);
                info!(
                    %transfer_id,
                    amount = %legs.amount(),
                    sender = %legs.debit().account_id,
                    recipient = %legs.credit().account_id,
                    attempts,
                    "transfer settled"
                );
                self.ack(delivery).await;
            }
            Ok(SettlementOutcome::AlreadySettled) => {
                progress.advance(SettlementState::Committed);
                Counters::bump(&self.counters.duplicates);
                info!(%transfer_id, "transfer already settled; skipping");
                self.ack(delivery).await;
            }
            Err(err) => {
                progress.advance(SettlementState::PermanentFailure);
                if err.is_retryable() {
                    error!(%transfer_id, attempts, error = %err, "settlement retries exhausted");
                } else {
                    warn!(%transfer_id, kind = %err.kind(), error = %err, "settlement failed permanently");
                }
                self.dead_letter(delivery, &err, attempts).await;
            }
        }
        progress.state()
    }

    async fn settle_with_retry(
        &self,
        intent: &ValidatedIntent,
        progress: &mut SettlementProgress,
    ) -> (LedgerResult<SettlementOutcome>, u32) {
        let mut retries = 0u32;
        loop {
            progress.advance(SettlementState::Settling);
            match self.settler.settle(intent).await {
                Err(err) if err.is_retryable() && self.retry.should_retry(retries) => {
                    retries += 1;
                    progress.advance(SettlementState::Retrying);
                    Counters::bump(&self.counters.retries);
                    let delay = self.retry.delay_for_attempt(retries);
                    debug!(
                        transfer_id = %intent.transfer_id,
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient settlement failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return (result, retries + 1),
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery<Vec<u8>>, err: &LedgerError, attempts: u32) {
        Counters::bump(&self.counters.permanent_failures);
        match self
            .dead_letters
            .send(DeadLetter::new(delivery, err, attempts))
            .await
        {
            Ok(()) => {
                Counters::bump(&self.counters.dead_lettered);
                self.ack(delivery).await;
            }
            Err(sink_err) => {
                error!(
                    delivery_id = %delivery.id(),
                    error = %sink_err,
                    "dead-letter sink refused message; leaving it unacknowledged"
                );
            }
        }
    }

    async fn ack(&self, delivery: &Delivery<Vec<u8>>) {
        if let Err(e) = self.consumer.ack(delivery).await {
            Counters::bump(&self.counters.ack_failures);
            error!(delivery_id = %delivery.id(), error = %e, "ack failed; message will be redelivered");
        }
    }
}

fn decode(payload: &[u8]) -> LedgerResult<ValidatedIntent> {
    TransferIntent::decode(payload)?.validate()
}
