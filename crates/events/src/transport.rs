//! Broker transport abstraction.
//!
//! A [`Transport`] knows how to open one connection plus one channel on a
//! concrete broker. [`BrokerConnection`](crate::BrokerConnection) owns the
//! lifecycle (single-flight connect, backoff, invalidation on close); the
//! transport only performs the I/O.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BrokerResult;
use crate::event::EventSink;
use crate::message::{Delivery, OutgoingMessage};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection and a channel on it.
    ///
    /// The transport must report loss of the connection or channel through
    /// `events` exactly once per channel.
    async fn open(&self, events: EventSink) -> BrokerResult<Arc<dyn Channel>>;
}

/// A logical session multiplexed over a connection.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Idempotently declare a durable queue.
    async fn declare_queue(&self, queue: &str) -> BrokerResult<()>;

    async fn publish(&self, queue: &str, message: OutgoingMessage) -> BrokerResult<()>;

    /// Wait for the next delivery on `queue`.
    ///
    /// Returns `Ok(None)` when nothing arrived within the channel's poll
    /// window; callers simply ask again.
    async fn next_delivery(&self, queue: &str) -> BrokerResult<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()>;

    /// Negative acknowledgement. With `requeue` the message goes back on its
    /// queue; without it the message is dropped (dead-lettered if supported).
    async fn reject(&self, delivery: &Delivery, requeue: bool, reason: &str) -> BrokerResult<()>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> BrokerResult<()>;
}
