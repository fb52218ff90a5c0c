//! Messages as they travel to and from the broker.

use std::collections::BTreeMap;

/// Message headers (string keys and values; ordered for stable logs).
pub type Headers = BTreeMap<String, String>;

/// A message handed to [`Channel::publish`](crate::Channel::publish).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
    /// Ask the broker to keep the message across its own restarts.
    pub persistent: bool,
}

impl OutgoingMessage {
    pub fn persistent(body: Vec<u8>) -> Self {
        Self {
            body,
            headers: Headers::new(),
            persistent: true,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Broker-assigned identity of one delivery, used to settle it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(String);

impl DeliveryTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message received from a queue. Immutable once produced by the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    tag: DeliveryTag,
    queue: String,
    body: Vec<u8>,
    headers: Headers,
    redelivered: bool,
}

impl Delivery {
    pub fn new(
        tag: DeliveryTag,
        queue: impl Into<String>,
        body: Vec<u8>,
        headers: Headers,
        redelivered: bool,
    ) -> Self {
        Self {
            tag,
            queue: queue.into(),
            body,
            headers,
            redelivered,
        }
    }

    pub fn tag(&self) -> &DeliveryTag {
        &self.tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// The broker has handed this message out before (requeue or lost consumer).
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Body as text, for logging payloads that could not be decoded.
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// The same message, ready to be put back on its queue unchanged.
    pub fn to_outgoing(&self) -> OutgoingMessage {
        OutgoingMessage {
            body: self.body.clone(),
            headers: self.headers.clone(),
            persistent: true,
        }
    }
}
