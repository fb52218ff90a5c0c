//! In-memory broker for tests/dev.
//!
//! - Queues with ready and unacked messages, like a real broker
//! - Unacked messages go back to the queue when their channel closes
//! - Failure injection for connects and a log of every settle/publish

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{BrokerError, BrokerResult};
use crate::event::{EventOrigin, EventSink};
use crate::message::{Delivery, DeliveryTag, Headers, OutgoingMessage};
use crate::transport::{Channel, Transport};

const DEFAULT_POLL_WINDOW: Duration = Duration::from_millis(100);

/// Broker-side record of operations, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    Published {
        queue: String,
        message: OutgoingMessage,
    },
    Acked {
        tag: DeliveryTag,
    },
    Rejected {
        tag: DeliveryTag,
        requeue: bool,
        reason: String,
    },
}

/// A message dropped by a reject without requeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub queue: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    headers: Headers,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    channel_id: u64,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    declared: HashSet<String>,
    unacked: HashMap<DeliveryTag, Unacked>,
    dead_letters: Vec<DeadLetter>,
    log: Vec<BrokerOp>,
    /// Open channels by id; a channel owns the broker, never the reverse.
    channels: Vec<(u64, Weak<MemoryChannel>)>,
    next_tag: u64,
    next_channel_id: u64,
    open_attempts: u32,
    failing_opens: u32,
    failing_declares: u32,
}

impl BrokerState {
    /// Return every unacked message of `channel_id` to the head of its queue.
    fn requeue_unacked(&mut self, channel_id: u64) {
        let tags: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| tag.clone())
            .collect();

        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                self.queues
                    .entry(unacked.queue)
                    .or_default()
                    .push_front(message);
            }
        }
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
    poll_window: Duration,
}

/// Cloneable handle to a shared in-memory broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_poll_window(DEFAULT_POLL_WINDOW)
    }

    pub fn with_poll_window(poll_window: Duration) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                poll_window,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.lock().failing_opens = count;
    }

    /// Make the next `count` queue declarations fail (e.g. a server still
    /// loading its dataset).
    pub fn fail_next_declares(&self, count: u32) {
        self.lock().failing_declares = count;
    }

    pub fn open_attempts(&self) -> u32 {
        self.lock().open_attempts
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.lock().declared.contains(queue)
    }

    /// Enqueue a message as an external producer would.
    pub fn push(&self, queue: &str, message: OutgoingMessage) {
        {
            let mut state = self.lock();
            state.log.push(BrokerOp::Published {
                queue: queue.to_string(),
                message: message.clone(),
            });
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(StoredMessage {
                    body: message.body,
                    headers: message.headers,
                    redelivered: false,
                });
        }
        self.inner.notify.notify_waiters();
    }

    /// Messages waiting to be delivered.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn operations(&self) -> Vec<BrokerOp> {
        self.lock().log.clone()
    }

    /// Every message published to `queue`, oldest first.
    pub fn published(&self, queue: &str) -> Vec<OutgoingMessage> {
        self.lock()
            .log
            .iter()
            .filter_map(|op| match op {
                BrokerOp::Published { queue: q, message } if q == queue => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn acked(&self) -> Vec<DeliveryTag> {
        self.lock()
            .log
            .iter()
            .filter_map(|op| match op {
                BrokerOp::Acked { tag } => Some(tag.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    /// Simulate the broker dropping every open connection.
    pub fn drop_connections(&self, reason: &str) {
        let channels = std::mem::take(&mut self.lock().channels);
        for channel in channels.iter().filter_map(|(_, c)| c.upgrade()) {
            channel.shutdown(EventOrigin::Connection, reason);
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn open(&self, events: EventSink) -> BrokerResult<Arc<dyn Channel>> {
        let mut state = self.lock();
        state.open_attempts += 1;
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(BrokerError::connection("connection refused (injected)"));
        }

        state.next_channel_id += 1;
        let channel = Arc::new(MemoryChannel {
            id: state.next_channel_id,
            broker: self.clone(),
            events,
            open: AtomicBool::new(true),
        });
        state.channels.retain(|(_, c)| c.strong_count() > 0);
        state
            .channels
            .push((channel.id, Arc::downgrade(&channel)));
        Ok(channel)
    }
}

struct MemoryChannel {
    id: u64,
    broker: InMemoryBroker,
    events: EventSink,
    open: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    fn try_take(&self, queue: &str) -> Option<Delivery> {
        let mut state = self.broker.lock();
        let message = state.queues.get_mut(queue)?.pop_front()?;

        state.next_tag += 1;
        let tag = DeliveryTag::new(state.next_tag.to_string());
        let delivery = Delivery::new(
            tag.clone(),
            queue,
            message.body.clone(),
            message.headers.clone(),
            message.redelivered,
        );
        state.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_string(),
                channel_id: self.id,
                message,
            },
        );
        Some(delivery)
    }

    /// Mark closed, hand unacked messages back and report the close once.
    fn shutdown(&self, origin: EventOrigin, reason: &str) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.broker.lock();
            state.requeue_unacked(self.id);
            state.channels.retain(|(id, _)| *id != self.id);
        }
        self.broker.inner.notify.notify_waiters();
        self.events.closed(origin, reason);
    }

    fn settle(&self, delivery: &Delivery) -> BrokerResult<Unacked> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        match state.unacked.get(delivery.tag()) {
            Some(u) if u.channel_id == self.id => {}
            _ => {
                return Err(BrokerError::command(format!(
                    "unknown delivery tag {}",
                    delivery.tag()
                )));
            }
        }
        state
            .unacked
            .remove(delivery.tag())
            .ok_or_else(|| BrokerError::command("delivery vanished"))
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, queue: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if state.failing_declares > 0 {
            state.failing_declares -= 1;
            return Err(BrokerError::command("LOADING dataset (injected)"));
        }
        state.declared.insert(queue.to_string());
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutgoingMessage) -> BrokerResult<()> {
        self.ensure_open()?;
        self.broker.push(queue, message);
        Ok(())
    }

    async fn next_delivery(&self, queue: &str) -> BrokerResult<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + self.broker.inner.poll_window;
        loop {
            let notified = self.broker.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_open()?;
            if let Some(delivery) = self.try_take(queue) {
                return Ok(Some(delivery));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        self.settle(delivery)?;
        self.broker.lock().log.push(BrokerOp::Acked {
            tag: delivery.tag().clone(),
        });
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool, reason: &str) -> BrokerResult<()> {
        let unacked = self.settle(delivery)?;
        {
            let mut state = self.broker.lock();
            state.log.push(BrokerOp::Rejected {
                tag: delivery.tag().clone(),
                requeue,
                reason: reason.to_string(),
            });
            if requeue {
                let mut message = unacked.message;
                message.redelivered = true;
                state
                    .queues
                    .entry(unacked.queue)
                    .or_default()
                    .push_back(message);
            } else {
                state.dead_letters.push(DeadLetter {
                    queue: unacked.queue,
                    body: unacked.message.body,
                    headers: unacked.message.headers,
                    reason: reason.to_string(),
                });
            }
        }
        if requeue {
            self.broker.inner.notify.notify_waiters();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> BrokerResult<()> {
        self.shutdown(EventOrigin::Channel, "closed by client");
        Ok(())
    }
}
