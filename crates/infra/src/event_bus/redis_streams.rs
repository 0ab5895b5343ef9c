//! Redis Streams-backed bus (durable, at-least-once delivery).
//!
//! - **Partition streams**: `{stream_prefix}:{partition}`, one per partition;
//!   a message's key picks the partition with [`partition_for`].
//! - **Consumer group**: one group for all settlement workers; entries stay in
//!   the group's pending list until `XACK`.
//! - **Ordering**: at most one outstanding delivery per partition, so one
//!   sender's transfers settle in publish order.
//! - **Crash recovery**: on start the consumer first re-reads its own pending
//!   entries (`XREADGROUP … 0`) and hands them out as redeliveries.
//! - **Dead-letter queue**: `XADD` to `dlq_key` with reason, kind and payload.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Value;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use payflow_core::{ErrorKind, LedgerError, LedgerResult};
use payflow_events::{Consumer, Delivery, EventBus, partition_for};

use crate::config::BusConfig;
use crate::dead_letter::{DeadLetter, DeadLetterSink};

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    #[error("consumer state lock poisoned")]
    Poisoned,
}

impl From<RedisStreamsError> for LedgerError {
    fn from(err: RedisStreamsError) -> Self {
        LedgerError::new(ErrorKind::TransientBusError, err.to_string())
    }
}

fn command(name: &'static str) -> impl Fn(redis::RedisError) -> RedisStreamsError {
    move |e| RedisStreamsError::Command(format!("{name} failed: {e}"))
}

/// One entry read from a partition stream.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEntry {
    partition: u32,
    entry_id: String,
    key: String,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct ReadState {
    /// Partitions with an outstanding delivery.
    busy: Vec<bool>,
    /// Partitions whose own pending list has been drained after start.
    recovered: Vec<bool>,
    buffer: VecDeque<Delivery<Vec<u8>>>,
}

pub struct RedisStreamsBus {
    writer: MultiplexedConnection,
    /// Separate connection so a blocking `XREADGROUP` never delays writes.
    reader: MultiplexedConnection,
    stream_prefix: String,
    dlq_key: String,
    group: String,
    consumer: String,
    partitions: u32,
    state: Mutex<ReadState>,
    released: Notify,
}

impl RedisStreamsBus {
    /// Connect and make sure the consumer group exists on every partition.
    pub async fn connect(config: &BusConfig) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        let writer = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        let reader = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        let partitions = config.partitions.max(1);
        let bus = Self {
            writer,
            reader,
            stream_prefix: config.stream_prefix.clone(),
            dlq_key: config.dlq_key.clone(),
            group: config.group.clone(),
            consumer: config.consumer.clone(),
            partitions,
            state: Mutex::new(ReadState {
                busy: vec![false; partitions as usize],
                recovered: vec![false; partitions as usize],
                buffer: VecDeque::new(),
            }),
            released: Notify::new(),
        };
        bus.ensure_consumer_groups().await?;

        info!(
            stream_prefix = %bus.stream_prefix,
            partitions,
            group = %bus.group,
            consumer = %bus.consumer,
            "Redis Streams bus connected"
        );
        Ok(bus)
    }

    fn stream(&self, partition: u32) -> String {
        stream_key(&self.stream_prefix, partition)
    }

    /// `XGROUP CREATE … 0 MKSTREAM` per partition; an existing group is fine.
    async fn ensure_consumer_groups(&self) -> Result<(), RedisStreamsError> {
        let mut conn = self.writer.clone();
        for p in 0..self.partitions {
            let created: redis::RedisResult<String> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(self.stream(p))
                .arg(&self.group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;
            match created {
                Ok(_) => debug!(partition = p, group = %self.group, "consumer group created"),
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => return Err(RedisStreamsError::ConsumerGroup(e.to_string())),
            }
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ReadState>, RedisStreamsError> {
        self.state.lock().map_err(|_| RedisStreamsError::Poisoned)
    }

    /// Free partitions split into (still recovering, caught up).
    fn free_partitions(&self) -> Result<(Vec<u32>, Vec<u32>), RedisStreamsError> {
        let state = self.lock()?;
        let (recovering, fresh): (Vec<u32>, Vec<u32>) = (0..self.partitions)
            .filter(|p| !state.busy[*p as usize])
            .partition(|p| !state.recovered[*p as usize]);
        Ok((recovering, fresh))
    }

    fn stash(&self, entries: Vec<StreamEntry>, redelivered: bool) -> Result<(), RedisStreamsError> {
        let mut state = self.lock()?;
        for entry in entries {
            state.busy[entry.partition as usize] = true;
            let id = delivery_id(entry.partition, &entry.entry_id);
            state.buffer.push_back(Delivery::new(
                id,
                entry.partition,
                entry.key,
                redelivered,
                entry.payload,
            ));
        }
        Ok(())
    }

    fn take_buffered(&self) -> Result<Option<Delivery<Vec<u8>>>, RedisStreamsError> {
        Ok(self.lock()?.buffer.pop_front())
    }

    async fn read(
        &self,
        partitions: &[u32],
        from: &str,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, RedisStreamsError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg((block.as_millis() as u64).max(1));
        }
        cmd.arg("STREAMS");
        for p in partitions {
            cmd.arg(self.stream(*p));
        }
        for _ in partitions {
            cmd.arg(from);
        }

        let mut conn = self.reader.clone();
        let reply: Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(command("XREADGROUP"))?;

        let (entries, tombstones) = parse_read_reply(&self.stream_prefix, reply)?;
        for (partition, entry_id) in tombstones {
            // Pending entry whose stream record was trimmed away.
            warn!(partition, %entry_id, "acknowledging pending entry without fields");
            self.xack(partition, &entry_id).await?;
        }
        Ok(entries)
    }

    async fn xack(&self, partition: u32, entry_id: &str) -> Result<(), RedisStreamsError> {
        let mut conn = self.writer.clone();
        let _: u64 = redis::cmd("XACK")
            .arg(self.stream(partition))
            .arg(&self.group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await
            .map_err(command("XACK"))?;
        Ok(())
    }
}

#[async_trait]
impl EventBus<Vec<u8>> for RedisStreamsBus {
    type Error = RedisStreamsError;

    #[instrument(skip(self, message), fields(bytes = message.len()), err)]
    async fn publish(&self, key: &str, message: Vec<u8>) -> Result<(), Self::Error> {
        let partition = partition_for(key, self.partitions);
        let mut conn = self.writer.clone();
        let _: String = redis::cmd("XADD")
            .arg(self.stream(partition))
            .arg("*")
            .arg("key")
            .arg(key)
            .arg("payload")
            .arg(&message[..])
            .query_async(&mut conn)
            .await
            .map_err(command("XADD"))?;
        Ok(())
    }
}

#[async_trait]
impl Consumer<Vec<u8>> for RedisStreamsBus {
    type Error = RedisStreamsError;

    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery<Vec<u8>>>, Self::Error> {
        if let Some(delivery) = self.take_buffered()? {
            return Ok(Some(delivery));
        }

        let (recovering, fresh) = self.free_partitions()?;
        if !recovering.is_empty() {
            let entries = self.read(&recovering, "0", None).await?;
            let seen: HashSet<u32> = entries.iter().map(|e| e.partition).collect();
            {
                let mut state = self.lock()?;
                for p in recovering.iter().filter(|p| !seen.contains(p)) {
                    state.recovered[*p as usize] = true;
                }
            }
            if !entries.is_empty() {
                debug!(count = entries.len(), "recovered pending entries");
                self.stash(entries, true)?;
                return self.take_buffered();
            }
        }

        if fresh.is_empty() {
            let _ = tokio::time::timeout(timeout, self.released.notified()).await;
            return Ok(None);
        }

        let entries = self.read(&fresh, ">", Some(timeout)).await?;
        self.stash(entries, false)?;
        self.take_buffered()
    }

    async fn ack(&self, delivery: &Delivery<Vec<u8>>) -> Result<(), Self::Error> {
        let (partition, entry_id) = split_delivery_id(delivery.id())?;
        let acked = self.xack(partition, entry_id).await;

        // Released even when XACK failed: the entry stays pending and comes
        // back after a restart, which settlement tolerates.
        if let Some(busy) = self.lock()?.busy.get_mut(partition as usize) {
            *busy = false;
        }
        self.released.notify_one();
        acked
    }
}

#[async_trait]
impl DeadLetterSink for RedisStreamsBus {
    async fn send(&self, letter: DeadLetter) -> LedgerResult<()> {
        let mut conn = self.writer.clone();
        let transfer_id = letter
            .transfer_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("delivery_id")
            .arg(&letter.delivery_id)
            .arg("key")
            .arg(&letter.key)
            .arg("partition")
            .arg(letter.partition)
            .arg("kind")
            .arg(letter.kind.as_str())
            .arg("reason")
            .arg(&letter.reason)
            .arg("attempts")
            .arg(letter.attempts)
            .arg("transfer_id")
            .arg(transfer_id)
            .arg("failed_at")
            .arg(letter.failed_at.to_rfc3339())
            .arg("payload")
            .arg(&letter.payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| LedgerError::from(command("DLQ XADD")(e)))?;

        warn!(
            delivery_id = %letter.delivery_id,
            kind = %letter.kind,
            attempts = letter.attempts,
            "Message sent to dead-letter queue"
        );
        Ok(())
    }
}

fn stream_key(prefix: &str, partition: u32) -> String {
    format!("{prefix}:{partition}")
}

fn delivery_id(partition: u32, entry_id: &str) -> String {
    format!("{partition}/{entry_id}")
}

fn split_delivery_id(id: &str) -> Result<(u32, &str), RedisStreamsError> {
    id.split_once('/')
        .and_then(|(p, entry)| p.parse::<u32>().ok().map(|p| (p, entry)))
        .ok_or_else(|| RedisStreamsError::Deserialization(format!("bad delivery id {id:?}")))
}

fn partition_of(prefix: &str, stream: &str) -> Option<u32> {
    stream
        .strip_prefix(prefix)?
        .strip_prefix(':')?
        .parse()
        .ok()
}

fn bytes(value: &Value) -> Option<&[u8]> {
    match value {
        Value::Data(data) => Some(data),
        Value::Status(s) => Some(s.as_bytes()),
        _ => None,
    }
}

type Tombstone = (u32, String);

/// Parse an `XREADGROUP` reply.
///
/// Shape: `[[stream, [[id, [field, value, …]], …]], …]`, or nil on timeout.
/// Pending entries whose record was deleted come back with nil fields and are
/// returned separately.
fn parse_read_reply(
    prefix: &str,
    reply: Value,
) -> Result<(Vec<StreamEntry>, Vec<Tombstone>), RedisStreamsError> {
    let bad = |what: &str| RedisStreamsError::Deserialization(format!("XREADGROUP reply: {what}"));
    let mut entries = Vec::new();
    let mut tombstones = Vec::new();

    let streams = match reply {
        Value::Nil => return Ok((entries, tombstones)),
        Value::Bulk(streams) => streams,
        _ => return Err(bad("expected an array of streams")),
    };

    for stream in streams {
        let Value::Bulk(parts) = stream else {
            return Err(bad("expected [stream, entries]"));
        };
        let [name, records] = parts.as_slice() else {
            return Err(bad("expected [stream, entries]"));
        };
        let name = bytes(name)
            .map(String::from_utf8_lossy)
            .ok_or_else(|| bad("stream name"))?;
        let partition = partition_of(prefix, &name)
            .ok_or_else(|| bad(&format!("unexpected stream {name}")))?;
        let Value::Bulk(records) = records else {
            return Err(bad("expected entry list"));
        };

        for record in records {
            let Value::Bulk(record) = record else {
                return Err(bad("expected [id, fields]"));
            };
            let (Some(id), fields) = (record.first().and_then(bytes), record.get(1)) else {
                return Err(bad("entry id"));
            };
            let entry_id = String::from_utf8_lossy(id).into_owned();

            let Some(Value::Bulk(fields)) = fields else {
                tombstones.push((partition, entry_id));
                continue;
            };
            let mut key = None;
            let mut payload = None;
            for pair in fields.chunks(2) {
                if let [field, value] = pair {
                    match bytes(field) {
                        Some(b"key") => key = bytes(value).map(|v| String::from_utf8_lossy(v).into_owned()),
                        Some(b"payload") => payload = bytes(value).map(<[u8]>::to_vec),
                        _ => {}
                    }
                }
            }
            let payload = payload.ok_or_else(|| bad("missing payload field"))?;
            entries.push(StreamEntry {
                partition,
                entry_id,
                key: key.unwrap_or_default(),
                payload,
            });
        }
    }
    Ok((entries, tombstones))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn delivery_ids_round_trip() {
        let id = delivery_id(7, "1526919030474-55");
        assert_eq!(split_delivery_id(&id).unwrap(), (7, "1526919030474-55"));
        assert!(split_delivery_id("nope").is_err());
        assert_eq!(stream_key("payflow:transfers", 3), "payflow:transfers:3");
        assert_eq!(partition_of("payflow:transfers", "payflow:transfers:12"), Some(12));
        assert_eq!(partition_of("payflow:transfers", "other:1"), None);
    }

    #[test]
    fn parses_entries_and_tombstones() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("payflow:transfers:4"),
            Value::Bulk(vec![
                Value::Bulk(vec![
                    data("1-0"),
                    Value::Bulk(vec![data("key"), data("0811"), data("payload"), data("{}")]),
                ]),
                Value::Bulk(vec![data("2-0"), Value::Nil]),
            ]),
        ])]);

        let (entries, tombstones) = parse_read_reply("payflow:transfers", reply).unwrap();
        assert_eq!(
            entries,
            vec![StreamEntry {
                partition: 4,
                entry_id: "1-0".to_string(),
                key: "0811".to_string(),
                payload: b"{}".to_vec(),
            }]
        );
        assert_eq!(tombstones, vec![(4, "2-0".to_string())]);
    }

    #[test]
    fn nil_reply_is_empty() {
        let (entries, tombstones) = parse_read_reply("p", Value::Nil).unwrap();
        assert!(entries.is_empty() && tombstones.is_empty());
        assert!(parse_read_reply("p", data("x")).is_err());
    }

    #[test]
    fn redis_errors_are_transient_for_callers() {
        let err: LedgerError = RedisStreamsError::Connection("refused".into()).into();
        assert_eq!(err.kind(), ErrorKind::TransientBusError);
    }
}
