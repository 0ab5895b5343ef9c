//! In-memory partitioned bus for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::bus::{Consumer, EventBus, partition_for};
use crate::delivery::Delivery;

/// Default number of partitions.
pub const DEFAULT_PARTITIONS: u32 = 16;

#[derive(Debug, thiserror::Error)]
pub enum InMemoryBusError {
    /// Internal lock poisoning.
    #[error("in-memory bus lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
struct Queued<M> {
    seq: u64,
    /// Number of times this message has been handed out.
    handouts: u32,
    key: String,
    redelivered: bool,
    payload: M,
}

#[derive(Debug)]
struct BusState<M> {
    queues: Vec<VecDeque<Queued<M>>>,
    /// Partitions with an outstanding (unacked) delivery.
    busy: Vec<bool>,
    in_flight: HashMap<u64, (u32, Queued<M>)>,
    next_seq: u64,
    cursor: usize,
    published: u64,
    acked: u64,
}

/// In-memory keyed bus with a single consumer group.
///
/// - Messages are routed to partitions by key and delivered in publish order
///   within a partition.
/// - A partition hands out its next message only after the previous one is
///   acknowledged, like a log consumer committing offsets.
/// - [`InMemoryEventBus::redeliver_unacked`] simulates a consumer crash: every
///   outstanding delivery goes back to the head of its partition.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    partitions: u32,
    state: Mutex<BusState<M>>,
    notify: Notify,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: u32) -> Self {
        let partitions = partitions.max(1);
        Self {
            partitions,
            state: Mutex::new(BusState {
                queues: (0..partitions).map(|_| VecDeque::new()).collect(),
                busy: vec![false; partitions as usize],
                in_flight: HashMap::new(),
                next_seq: 0,
                cursor: 0,
                published: 0,
                acked: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Messages waiting to be delivered.
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.queues.iter().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    /// Deliveries handed out but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.state.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    pub fn published(&self) -> u64 {
        self.state.lock().map(|s| s.published).unwrap_or(0)
    }

    pub fn acked(&self) -> u64 {
        self.state.lock().map(|s| s.acked).unwrap_or(0)
    }

    /// Put every unacknowledged delivery back at the head of its partition.
    pub fn redeliver_unacked(&self) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        let mut outstanding: Vec<(u32, Queued<M>)> = state.in_flight.drain().map(|(_, v)| v).collect();
        // Newest first so push_front restores publish order.
        outstanding.sort_by(|a, b| b.1.seq.cmp(&a.1.seq));
        let count = outstanding.len();
        for (partition, mut queued) in outstanding {
            queued.redelivered = true;
            state.busy[partition as usize] = false;
            state.queues[partition as usize].push_front(queued);
        }
        drop(state);

        if count > 0 {
            debug!(count, "requeued unacknowledged deliveries");
            self.notify.notify_one();
        }
        count
    }
}

impl<M: Clone> InMemoryEventBus<M> {
    fn try_take(&self) -> Result<Option<Delivery<M>>, InMemoryBusError> {
        let mut state = self.state.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        let n = self.partitions as usize;

        for offset in 0..n {
            let p = (state.cursor + offset) % n;
            if state.busy[p] {
                continue;
            }
            if let Some(queued) = state.queues[p].pop_front() {
                let mut queued = queued;
                queued.handouts += 1;
                state.busy[p] = true;
                state.cursor = (p + 1) % n;
                let delivery = Delivery::new(
                    delivery_id(queued.seq, queued.handouts),
                    p as u32,
                    queued.key.clone(),
                    queued.redelivered,
                    queued.payload.clone(),
                );
                state.in_flight.insert(queued.seq, (p as u32, queued));
                return Ok(Some(delivery));
            }
        }

        Ok(None)
    }
}

/// `"{seq}.{handouts}"`: unique per handout, so a redelivered copy gets a new id.
fn delivery_id(seq: u64, handouts: u32) -> String {
    format!("{seq}.{handouts}")
}

fn parse_delivery_id(id: &str) -> Option<(u64, u32)> {
    let (seq, handouts) = id.split_once('.')?;
    Some((seq.parse().ok()?, handouts.parse().ok()?))
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + Sync + 'static,
{
    type Error = InMemoryBusError;

    async fn publish(&self, key: &str, message: M) -> Result<(), Self::Error> {
        let partition = partition_for(key, self.partitions) as usize;
        {
            let mut state = self.state.lock().map_err(|_| InMemoryBusError::Poisoned)?;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.published += 1;
            state.queues[partition].push_back(Queued {
                seq,
                handouts: 0,
                key: key.to_string(),
                redelivered: false,
                payload: message,
            });
        }
        self.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl<M> Consumer<M> for InMemoryEventBus<M>
where
    M: Clone + Send + Sync + 'static,
{
    type Error = InMemoryBusError;

    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery<M>>, Self::Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.try_take()? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Woken by publish/ack/redeliver; the timeout bounds missed wakeups.
            let _ = tokio::time::timeout(deadline - now, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery<M>) -> Result<(), Self::Error> {
        let Some((seq, handouts)) = parse_delivery_id(delivery.id()) else {
            return Ok(());
        };
        {
            let mut state = self.state.lock().map_err(|_| InMemoryBusError::Poisoned)?;
            // An ack from an earlier handout must not release the current one.
            let current = matches!(state.in_flight.get(&seq), Some((_, q)) if q.handouts == handouts);
            if current {
                if let Some((partition, _)) = state.in_flight.remove(&seq) {
                    state.busy[partition as usize] = false;
                    state.acked += 1;
                }
            } else {
                debug!(delivery_id = %delivery.id(), "ignoring ack for a stale delivery");
            }
        }
        self.notify.notify_one();
        Ok(())
    }
}
