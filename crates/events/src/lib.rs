//! `newsflow-events`: broker plumbing for the indexing pipeline.
//!
//! This crate owns the broker-facing mechanics and stays free of any
//! concrete broker client:
//!
//! - **Transport / Channel**: the seam a concrete broker implements
//! - **BrokerConnection**: one shared session, single-flight connect with
//!   linear backoff, lazy reconnect after a close
//! - **Publisher**: persistent job publishing
//! - **Acknowledger**: consume-once settlement of a delivery
//! - **InMemoryBroker**: a broker for tests and local runs

pub mod acknowledger;
pub mod connection;
pub mod error;
pub mod event;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod retry;
pub mod transport;

pub use acknowledger::Acknowledger;
pub use connection::{BrokerConnection, ConnectionSettings, Session};
pub use error::{BrokerError, BrokerResult};
pub use event::{ConnectionEvent, ConnectionObserver, EventOrigin, EventSink};
pub use memory::{BrokerOp, DeadLetter, InMemoryBroker};
pub use message::{Delivery, DeliveryTag, Headers, OutgoingMessage};
pub use publisher::Publisher;
pub use retry::RetryPolicy;
pub use transport::{Channel, Transport};
