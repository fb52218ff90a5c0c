//! `newsflow-core`: domain building blocks for the indexing pipeline.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! records, the documents derived from them, and the jobs that carry record
//! ids through the broker.

pub mod document;
pub mod error;
pub mod id;
pub mod job;
pub mod record;

pub use document::{DocumentFields, IndexDocument};
pub use error::{DomainError, DomainResult};
pub use id::RecordId;
pub use job::{ATTEMPTS_HEADER, Job, JobPayload};
pub use record::{NewRecord, Record};
