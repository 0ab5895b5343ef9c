//! Dead-letter sinks for settlement messages that cannot succeed.
//!
//! A message is dead-lettered when it is malformed, fails permanently, or
//! keeps failing transiently past the settlement retry policy. The worker
//! acknowledges the original delivery only after the sink accepted it.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use payflow_core::{ErrorKind, LedgerError, LedgerResult, TransactionId};
use payflow_events::Delivery;

/// A failed message with the reason it was given up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    pub delivery_id: String,
    pub key: String,
    pub partition: u32,
    /// Original payload, lossily decoded for inspection.
    pub payload: String,
    pub kind: ErrorKind,
    pub reason: String,
    /// Settlement attempts made before giving up.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<TransactionId>,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(delivery: &Delivery<Vec<u8>>, error: &LedgerError, attempts: u32) -> Self {
        Self {
            delivery_id: delivery.id().to_string(),
            key: delivery.key().to_string(),
            partition: delivery.partition(),
            payload: String::from_utf8_lossy(delivery.payload()).into_owned(),
            kind: error.kind(),
            reason: error.message().to_string(),
            attempts,
            transfer_id: error.transfer_id(),
            failed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Durably store `letter`. An error means the letter was not stored and
    /// the original delivery must stay unacknowledged.
    async fn send(&self, letter: DeadLetter) -> LedgerResult<()>;
}

#[async_trait]
impl<T> DeadLetterSink for std::sync::Arc<T>
where
    T: DeadLetterSink + ?Sized,
{
    async fn send(&self, letter: DeadLetter) -> LedgerResult<()> {
        (**self).send(letter).await
    }
}

/// Keeps dead letters in memory.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
    fail_next: AtomicU32,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next `n` sends fail.
    pub fn fail_next_sends(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> LedgerResult<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(LedgerError::new(
                ErrorKind::TransientBusError,
                "injected dead-letter failure",
            ));
        }

        warn!(
            delivery_id = %letter.delivery_id,
            kind = %letter.kind,
            reason = %letter.reason,
            "message dead-lettered"
        );
        self.letters
            .lock()
            .map_err(|_| LedgerError::new(ErrorKind::StoreFailure, "dead-letter sink lock poisoned"))?
            .push(letter);
        Ok(())
    }
}
