//! Keyed, partitioned message bus abstraction (mechanics only).
//!
//! Producers publish a message under a key. The key picks a partition and the
//! bus only orders messages within one partition, so everything that must be
//! applied in order (for example, all transfers of one sender) has to share a
//! key.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: a message stays outstanding until the consumer calls
//!   [`Consumer::ack`]. A consumer crash before the ack leads to redelivery.
//! - **Consumers must be idempotent**: processing the same message twice must
//!   have the same effect as processing it once.
//! - **No exactly-once**: there is no transactional coupling between the ack
//!   and the consumer's own side effects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::delivery::Delivery;

/// Publishing half of a bus.
#[async_trait]
pub trait EventBus<M>: Send + Sync
where
    M: Send + Sync + 'static,
{
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    /// Append `message` to the partition owned by `key`.
    ///
    /// Returns once the transport has durably accepted the message.
    async fn publish(&self, key: &str, message: M) -> Result<(), Self::Error>;
}

/// Consuming half of a bus (one consumer within a consumer group).
#[async_trait]
pub trait Consumer<M>: Send + Sync
where
    M: Send + Sync + 'static,
{
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    /// Wait up to `timeout` for the next delivery. `Ok(None)` means nothing
    /// arrived in time.
    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery<M>>, Self::Error>;

    /// Mark a delivery as processed. Acknowledging twice is a no-op.
    async fn ack(&self, delivery: &Delivery<M>) -> Result<(), Self::Error>;
}

#[async_trait]
impl<M, B> EventBus<M> for Arc<B>
where
    M: Send + Sync + 'static,
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    async fn publish(&self, key: &str, message: M) -> Result<(), Self::Error> {
        (**self).publish(key, message).await
    }
}

#[async_trait]
impl<M, C> Consumer<M> for Arc<C>
where
    M: Send + Sync + 'static,
    C: Consumer<M> + ?Sized,
{
    type Error = C::Error;

    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery<M>>, Self::Error> {
        (**self).poll(timeout).await
    }

    async fn ack(&self, delivery: &Delivery<M>) -> Result<(), Self::Error> {
        (**self).ack(delivery).await
    }
}

/// Stable key → partition mapping (32-bit FNV-1a).
///
/// Must not change between releases: producers and consumers of different
/// builds have to agree on it.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash % partitions
}
