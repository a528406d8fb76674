//! Redis Streams-backed message bus (durable, at-least-once delivery).
//!
//! This implementation maps the bus topology onto Redis Streams:
//! - **Routing key → stream**: `fleetline:bus:<routing key>`, appended with `XADD`
//! - **Queue → consumer group**: a queue owns one consumer group on the stream
//!   of every routing key bound to it, so bindings fan out naturally
//! - **Replicas → consumers**: replicas of a process join the group under their
//!   own consumer name and compete for entries
//! - **Ack**: `XACK` once the handler returned
//! - **Nack**: the entry is copied to `fleetline:bus:dlq` and acknowledged; it is
//!   never requeued
//! - **Recovery**: entries left pending by a crashed consumer are claimed with
//!   `XAUTOCLAIM` when a consumer starts

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use fleetline_events::contracts;
use fleetline_events::{
    BusError, ConsumerHandle, Delivery, Envelope, EnvelopeHandler, MessageBus,
};

const STREAM_PREFIX: &str = "fleetline:bus:";
const DLQ_KEY: &str = "fleetline:bus:dlq";

const ROUTING_KEY_FIELD: &str = "routing_key";
const ENVELOPE_FIELD: &str = "envelope";

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Tuning knobs for [`RedisStreamsBus`].
#[derive(Debug, Clone)]
pub struct RedisBusOptions {
    /// Name this process uses inside consumer groups. Must be unique per replica.
    pub consumer_name: String,
    /// Upper bound on waiting for `XADD` confirmation.
    pub publish_timeout: Duration,
    /// Upper bound on establishing the initial connection.
    pub connect_timeout: Duration,
    /// How long a single `XREADGROUP` blocks; also the worst-case stop latency.
    pub block: Duration,
    pub batch_size: usize,
    /// Pending entries idle for longer than this are claimed on consumer start.
    pub reclaim_idle: Duration,
    /// Approximate cap on stream length.
    pub max_stream_len: usize,
}

impl Default for RedisBusOptions {
    fn default() -> Self {
        Self {
            consumer_name: format!("consumer-{}", uuid::Uuid::now_v7()),
            publish_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(5),
            block: Duration::from_secs(1),
            batch_size: 16,
            reclaim_idle: Duration::from_secs(60),
            max_stream_len: 10_000,
        }
    }
}

/// Message bus on Redis Streams.
#[derive(Clone)]
pub struct RedisStreamsBus {
    client: redis::Client,
    conn: ConnectionManager,
    options: Arc<RedisBusOptions>,
}

impl std::fmt::Debug for RedisStreamsBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsBus")
            .field("consumer_name", &self.options.consumer_name)
            .finish()
    }
}

fn transport(err: RedisError) -> BusError {
    BusError::Transport(err.to_string())
}

fn stream_key(routing_key: &str) -> String {
    format!("{STREAM_PREFIX}{routing_key}")
}

impl RedisStreamsBus {
    /// Connect and verify the broker is reachable.
    ///
    /// Failure here is meant to be fatal: a process does not boot degraded.
    pub async fn connect(
        redis_url: impl AsRef<str>,
        options: RedisBusOptions,
    ) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(transport)?;

        let mut conn = timeout(options.connect_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| BusError::Timeout(options.connect_timeout))?
            .map_err(transport)?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(transport)?;

        info!(consumer = %options.consumer_name, "connected to redis streams bus");

        Ok(Self {
            client,
            conn,
            options: Arc::new(options),
        })
    }

    /// Create the consumer group of `queue` on `stream` (idempotent).
    ///
    /// Groups start at the end of the stream: a queue sees envelopes published
    /// after it was first declared.
    async fn ensure_group(
        conn: &mut ConnectionManager,
        stream: &str,
        queue: &str,
    ) -> Result<(), BusError> {
        let created: Result<(), RedisError> = conn.xgroup_create_mkstream(stream, queue, "$").await;
        match created {
            Ok(()) => {
                debug!(stream, queue, "created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(transport(e)),
        }
    }
}

#[async_trait]
impl MessageBus for RedisStreamsBus {
    #[instrument(skip(self, envelope), fields(owner_id = envelope.owner_id().unwrap_or("")), err)]
    async fn publish(&self, routing_key: &str, envelope: Envelope) -> Result<(), BusError> {
        let payload = envelope
            .to_bytes()
            .map_err(|e| BusError::Serialization(e.to_string()))?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream_key(routing_key))
            .arg("MAXLEN")
            .arg("~")
            .arg(self.options.max_stream_len)
            .arg("*")
            .arg(ROUTING_KEY_FIELD)
            .arg(routing_key)
            .arg(ENVELOPE_FIELD)
            .arg(payload);

        let mut conn = self.conn.clone();
        let _: String = timeout(self.options.publish_timeout, cmd.query_async(&mut conn))
            .await
            .map_err(|_| BusError::Timeout(self.options.publish_timeout))?
            .map_err(|e| BusError::Transport(format!("XADD failed: {e}")))?;

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Result<ConsumerHandle, BusError> {
        let binding =
            contracts::binding(queue).ok_or_else(|| BusError::UnknownQueue(queue.to_string()))?;

        // Blocking reads get their own connection so they never stall publishes
        // multiplexed on the shared one.
        let mut conn = timeout(
            self.options.connect_timeout,
            ConnectionManager::new(self.client.clone()),
        )
        .await
        .map_err(|_| BusError::Timeout(self.options.connect_timeout))?
        .map_err(transport)?;

        let streams: Vec<String> = binding.routing_keys.iter().map(|rk| stream_key(rk)).collect();
        for stream in &streams {
            Self::ensure_group(&mut conn, stream, queue).await?;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let consumer = StreamConsumer {
            conn,
            queue: binding.queue,
            streams,
            handler,
            options: Arc::clone(&self.options),
        };
        let task = tokio::spawn(consumer.run(stop_rx));

        info!(queue = binding.queue, consumer = %self.options.consumer_name, "consumer started");
        Ok(ConsumerHandle::new(binding.queue, stop_tx, task))
    }
}

/// One entry read from a stream.
#[derive(Debug, Clone)]
struct StreamEntry {
    stream: String,
    id: String,
    fields: HashMap<String, String>,
}

struct StreamConsumer {
    conn: ConnectionManager,
    queue: &'static str,
    streams: Vec<String>,
    handler: Arc<dyn EnvelopeHandler>,
    options: Arc<RedisBusOptions>,
}

impl StreamConsumer {
    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut backoff = Backoff::default();

        for entry in self.reclaim_idle().await {
            self.process(entry).await;
        }

        // A dropped handle closes the channel, which also means stop.
        while !*stop.borrow() && stop.has_changed().is_ok() {
            match self.read_batch().await {
                Ok(entries) => {
                    backoff.reset();
                    // Entries already read are pending on this consumer; finish
                    // them even if a stop arrived meanwhile.
                    for entry in entries {
                        self.process(entry).await;
                    }
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(queue = self.queue, error = %err, ?delay, "stream read failed; backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.changed() => break,
                    }
                }
            }
        }

        info!(queue = self.queue, "consumer stopped");
    }

    async fn read_batch(&mut self) -> Result<Vec<StreamEntry>, RedisError> {
        let opts = StreamReadOptions::default()
            .group(self.queue, &self.options.consumer_name)
            .count(self.options.batch_size)
            .block(self.options.block.as_millis() as usize);

        let ids: Vec<&str> = self.streams.iter().map(|_| ">").collect();
        let reply: Option<StreamReadReply> =
            self.conn
                .xread_options(self.streams.as_slice(), ids.as_slice(), &opts)
                .await?;

        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for id in key.ids {
                let fields = id
                    .map
                    .iter()
                    .filter_map(|(k, v)| {
                        redis::from_redis_value::<String>(v)
                            .ok()
                            .map(|v| (k.clone(), v))
                    })
                    .collect();
                entries.push(StreamEntry {
                    stream: key.key.clone(),
                    id: id.id,
                    fields,
                });
            }
        }
        Ok(entries)
    }

    /// Claim entries a dead consumer left pending.
    async fn reclaim_idle(&mut self) -> Vec<StreamEntry> {
        let mut claimed = Vec::new();
        for stream in self.streams.clone() {
            let reply: Result<redis::Value, RedisError> = redis::cmd("XAUTOCLAIM")
                .arg(&stream)
                .arg(self.queue)
                .arg(&self.options.consumer_name)
                .arg(self.options.reclaim_idle.as_millis() as u64)
                .arg("0-0")
                .arg("COUNT")
                .arg(self.options.batch_size)
                .query_async(&mut self.conn)
                .await;

            match reply {
                Ok(value) => {
                    let entries = parse_autoclaim(&stream, value);
                    if !entries.is_empty() {
                        info!(queue = self.queue, stream = %stream, count = entries.len(), "reclaimed idle entries");
                    }
                    claimed.extend(entries);
                }
                Err(err) => warn!(queue = self.queue, stream = %stream, error = %err, "XAUTOCLAIM failed"),
            }
        }
        claimed
    }

    async fn process(&mut self, entry: StreamEntry) {
        let Some(raw) = entry.fields.get(ENVELOPE_FIELD) else {
            warn!(queue = self.queue, id = %entry.id, "stream entry without envelope; dropping");
            self.ack(&entry).await;
            return;
        };

        let routing_key = entry
            .fields
            .get(ROUTING_KEY_FIELD)
            .cloned()
            .unwrap_or_else(|| entry.stream.trim_start_matches(STREAM_PREFIX).to_string());

        let envelope = match Envelope::from_bytes(raw.as_bytes()) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Redelivering a malformed payload cannot succeed.
                warn!(queue = self.queue, id = %entry.id, error = %err, "malformed envelope; dropping");
                self.ack(&entry).await;
                return;
            }
        };

        let delivery = Delivery::new(routing_key, envelope);
        if let Err(err) = self.handler.handle(&delivery).await {
            warn!(
                queue = self.queue,
                routing_key = delivery.routing_key(),
                reason = %err,
                "handler failed; dead-lettering entry"
            );
            self.dead_letter(&entry, delivery.routing_key(), raw, err.reason()).await;
        }

        self.ack(&entry).await;
    }

    async fn ack(&mut self, entry: &StreamEntry) {
        let acked: Result<i64, RedisError> =
            self.conn.xack(&entry.stream, self.queue, &[&entry.id]).await;
        if let Err(err) = acked {
            error!(queue = self.queue, id = %entry.id, error = %err, "XACK failed");
        }
    }

    async fn dead_letter(&mut self, entry: &StreamEntry, routing_key: &str, raw: &str, reason: &str) {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(DLQ_KEY)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.options.max_stream_len)
            .arg("*")
            .arg("queue")
            .arg(self.queue)
            .arg(ROUTING_KEY_FIELD)
            .arg(routing_key)
            .arg("original_id")
            .arg(&entry.id)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg(ENVELOPE_FIELD)
            .arg(raw);

        let added: Result<String, RedisError> = cmd.query_async(&mut self.conn).await;
        if let Err(err) = added {
            error!(queue = self.queue, id = %entry.id, error = %err, "dead-letter XADD failed");
        }
    }
}

/// Parse an `XAUTOCLAIM` reply: `[next-id, [[id, [k, v, ..]], ..], ..]`.
///
/// Entries deleted from the stream come back without fields and are skipped.
fn parse_autoclaim(stream: &str, value: redis::Value) -> Vec<StreamEntry> {
    let redis::Value::Bulk(parts) = value else {
        return Vec::new();
    };
    let Some(redis::Value::Bulk(raw_entries)) = parts.into_iter().nth(1) else {
        return Vec::new();
    };

    raw_entries
        .into_iter()
        .filter_map(|raw| {
            let redis::Value::Bulk(mut pair) = raw else {
                return None;
            };
            if pair.len() != 2 {
                return None;
            }
            let fields_value = pair.pop()?;
            let id: String = redis::from_redis_value(&pair.pop()?).ok()?;
            let redis::Value::Bulk(flat) = fields_value else {
                return None;
            };

            let fields = flat
                .chunks(2)
                .filter_map(|kv| match kv {
                    [k, v] => Some((
                        redis::from_redis_value::<String>(k).ok()?,
                        redis::from_redis_value::<String>(v).ok()?,
                    )),
                    _ => None,
                })
                .collect();

            Some(StreamEntry {
                stream: stream.to_string(),
                id,
                fields,
            })
        })
        .collect()
}

/// Exponential backoff for reconnect attempts.
#[derive(Debug)]
struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            current: INITIAL_BACKOFF,
        }
    }
}

impl Backoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> redis::Value {
        redis::Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::default();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        for _ in 0..10 {
            b.next_delay();
        }
        assert_eq!(b.next_delay(), MAX_BACKOFF);
        b.reset();
        assert_eq!(b.next_delay(), INITIAL_BACKOFF);
    }

    #[test]
    fn stream_key_embeds_routing_key() {
        assert_eq!(stream_key("trip.event.created"), "fleetline:bus:trip.event.created");
    }

    #[test]
    fn autoclaim_reply_is_parsed_and_deleted_entries_skipped() {
        let reply = redis::Value::Bulk(vec![
            data("0-0"),
            redis::Value::Bulk(vec![
                redis::Value::Bulk(vec![
                    data("1700000000000-0"),
                    redis::Value::Bulk(vec![
                        data(ROUTING_KEY_FIELD),
                        data("driver.cmd.trip_request"),
                        data(ENVELOPE_FIELD),
                        data(r#"{"ownerID":"d1"}"#),
                    ]),
                ]),
                redis::Value::Bulk(vec![data("1700000000001-0"), redis::Value::Nil]),
            ]),
            redis::Value::Bulk(vec![]),
        ]);

        let entries = parse_autoclaim("fleetline:bus:driver.cmd.trip_request", reply);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "1700000000000-0");
        assert_eq!(entries[0].fields[ENVELOPE_FIELD], r#"{"ownerID":"d1"}"#);
    }
}
