//! Redis Streams transport (durable, at-least-once delivery).
//!
//! The work queue is a stream consumed through one consumer group:
//!
//! - **Declare**: `XGROUP CREATE <queue> <group> 0 MKSTREAM` (`BUSYGROUP` ignored)
//! - **Publish**: `XADD <queue> * body <json> [header value ...]`
//! - **Deliver**: `XREADGROUP ... COUNT 1 BLOCK <ms>`; a fresh channel first
//!   drains this consumer's own pending entries so deliveries left unacked by
//!   a previous process are handed out again
//! - **Ack**: `XACK` + `XDEL` in one atomic pipeline
//! - **Reject (requeue)**: re-`XADD` the same fields, then ack the original
//! - **Reject (discard)**: `XADD <queue>:dead` with payload and reason, then ack
//!
//! Each channel owns two connections: one for commands and one for the
//! blocking reads, so a pending `XREADGROUP` never stalls acks or publishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadReply};
use tracing::{debug, instrument, warn};

use newsflow_events::{
    BrokerError, BrokerResult, Channel, Delivery, DeliveryTag, EventOrigin, EventSink, Headers,
    OutgoingMessage, Transport,
};

const BODY_FIELD: &str = "body";
const DEAD_LETTER_SUFFIX: &str = ":dead";
const DEFAULT_BLOCK: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct RedisStreamsSettings {
    pub group: String,
    pub consumer: String,
    /// Client name announced with `CLIENT SETNAME`.
    pub connection_name: String,
    /// How long one `XREADGROUP` may block before returning empty.
    pub block: Duration,
}

impl RedisStreamsSettings {
    pub fn new(
        group: impl Into<String>,
        consumer: impl Into<String>,
        connection_name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            connection_name: connection_name.into(),
            block: DEFAULT_BLOCK,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisStreamsTransport {
    client: Arc<redis::Client>,
    settings: RedisStreamsSettings,
}

impl RedisStreamsTransport {
    /// Create a transport for `redis_url` (e.g. `redis://localhost:6379`).
    ///
    /// No connection is made until [`Transport::open`].
    pub fn new(redis_url: impl AsRef<str>, settings: RedisStreamsSettings) -> BrokerResult<Self> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            settings,
        })
    }

    async fn named_connection(&self, role: &str) -> BrokerResult<MultiplexedConnection> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::connection(e.to_string()))?;

        let name = format!("{}:{role}", self.settings.connection_name);
        let _: () = redis::cmd("CLIENT")
            .arg("SETNAME")
            .arg(&name)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::connection(format!("CLIENT SETNAME failed: {e}")))?;
        Ok(conn)
    }
}

#[async_trait]
impl Transport for RedisStreamsTransport {
    #[instrument(skip(self, events), fields(generation = events.generation()))]
    async fn open(&self, events: EventSink) -> BrokerResult<Arc<dyn Channel>> {
        let commands = self.named_connection("commands").await?;
        let reader = self.named_connection("reader").await?;
        debug!("redis connections opened");

        Ok(Arc::new(RedisStreamsChannel {
            commands,
            reader,
            settings: self.settings.clone(),
            events,
            open: AtomicBool::new(true),
            pending_cursor: Mutex::new(Some("0".to_string())),
        }))
    }
}

struct RedisStreamsChannel {
    commands: MultiplexedConnection,
    reader: MultiplexedConnection,
    settings: RedisStreamsSettings,
    events: EventSink,
    open: AtomicBool,
    /// Last pending id handed out while draining; `None` once drained.
    pending_cursor: Mutex<Option<String>>,
}

impl RedisStreamsChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    /// Classify a redis error; connection loss closes the channel.
    fn fail(&self, operation: &str, err: redis::RedisError) -> BrokerError {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            if self.open.swap(false, Ordering::SeqCst) {
                warn!(operation, error = %err, "redis connection lost");
                self.events
                    .closed(EventOrigin::Connection, format!("{operation}: {err}"));
            }
            BrokerError::connection(format!("{operation} failed: {err}"))
        } else {
            self.events
                .error(EventOrigin::Channel, format!("{operation}: {err}"));
            BrokerError::command(format!("{operation} failed: {err}"))
        }
    }

    fn cursor(&self) -> Option<String> {
        self.pending_cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_cursor(&self, cursor: Option<String>) {
        *self
            .pending_cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = cursor;
    }

    async fn read_group(
        &self,
        queue: &str,
        start: &str,
        block: Option<Duration>,
    ) -> BrokerResult<Option<StreamId>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.settings.group)
            .arg(&self.settings.consumer)
            .arg("COUNT")
            .arg(1);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(queue).arg(start);

        let mut conn = self.reader.clone();
        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail("XREADGROUP", e))?;

        Ok(reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next()))
    }

    async fn add(&self, stream: &str, fields: Vec<(String, Vec<u8>)>) -> BrokerResult<()> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }

        let mut conn = self.commands.clone();
        let _: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail("XADD", e))?;
        Ok(())
    }

    async fn ack_and_delete(&self, delivery: &Delivery) -> BrokerResult<()> {
        let mut conn = self.commands.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(delivery.queue())
            .arg(&self.settings.group)
            .arg(delivery.tag().as_str())
            .ignore()
            .cmd("XDEL")
            .arg(delivery.queue())
            .arg(delivery.tag().as_str())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail("XACK", e))?;
        Ok(())
    }
}

/// Message fields as stored in the stream: the body plus one field per header.
fn message_fields(message: &OutgoingMessage) -> Vec<(String, Vec<u8>)> {
    let mut fields = vec![(BODY_FIELD.to_string(), message.body.clone())];
    fields.extend(
        message
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().into_bytes())),
    );
    fields
}

fn to_delivery(queue: &str, entry: StreamId, redelivered: bool) -> Delivery {
    let body = entry.get::<Vec<u8>>(BODY_FIELD).unwrap_or_default();
    let headers: Headers = entry
        .map
        .iter()
        .filter(|(field, _)| field.as_str() != BODY_FIELD)
        .filter_map(|(field, value)| {
            redis::from_redis_value::<String>(value)
                .ok()
                .map(|v| (field.clone(), v))
        })
        .collect();

    Delivery::new(DeliveryTag::new(entry.id), queue, body, headers, redelivered)
}

#[async_trait]
impl Channel for RedisStreamsChannel {
    async fn declare_queue(&self, queue: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut conn = self.commands.clone();
        let result: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&self.settings.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(self.fail("XGROUP CREATE", e)),
        }
    }

    async fn publish(&self, queue: &str, message: OutgoingMessage) -> BrokerResult<()> {
        self.ensure_open()?;
        self.add(queue, message_fields(&message)).await
    }

    async fn next_delivery(&self, queue: &str) -> BrokerResult<Option<Delivery>> {
        self.ensure_open()?;

        if let Some(cursor) = self.cursor() {
            match self.read_group(queue, &cursor, None).await? {
                Some(entry) => {
                    self.set_cursor(Some(entry.id.clone()));
                    debug!(entry_id = %entry.id, "redelivering pending entry");
                    return Ok(Some(to_delivery(queue, entry, true)));
                }
                None => self.set_cursor(None),
            }
        }

        Ok(self
            .read_group(queue, ">", Some(self.settings.block))
            .await?
            .map(|entry| to_delivery(queue, entry, false)))
    }

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        self.ensure_open()?;
        self.ack_and_delete(delivery).await
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool, reason: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        let fields = message_fields(&delivery.to_outgoing());

        if requeue {
            self.add(delivery.queue(), fields).await?;
        } else {
            let mut dead = fields;
            dead.push(("reason".to_string(), reason.as_bytes().to_vec()));
            dead.push(("original_id".to_string(), delivery.tag().as_str().as_bytes().to_vec()));
            dead.push(("failed_at".to_string(), Utc::now().to_rfc3339().into_bytes()));
            let dead_stream = format!("{}{DEAD_LETTER_SUFFIX}", delivery.queue());
            self.add(&dead_stream, dead).await?;
        }

        self.ack_and_delete(delivery).await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.events.closed(EventOrigin::Channel, "closed by client");
        }
        Ok(())
    }
}

impl core::fmt::Debug for RedisStreamsChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsChannel")
            .field("group", &self.settings.group)
            .field("consumer", &self.settings.consumer)
            .field("open", &self.is_open())
            .finish()
    }
}
