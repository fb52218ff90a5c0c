//! The indexing pipeline: consume jobs, index records, retry failures.
//!
//! ## Components
//!
//! - `JobHandler`: record lookup + idempotent document upsert
//! - `RetryScheduler`: republish-then-ack with linear backoff, discard when spent
//! - `Consumer`: prefetch-bounded consumption with restart on channel loss

pub mod consumer;
pub mod handler;
pub mod retry;

pub use consumer::{Consumer, ConsumerError, ConsumerSettings, ConsumerStats};
pub use handler::{JobError, JobHandler, JobOutcome};
pub use retry::{RetryOutcome, RetryScheduler};
