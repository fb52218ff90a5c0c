//! Infrastructure layer: broker transport, record store, search index,
//! configuration, and the indexing pipeline built on top of them.

pub mod broker;
pub mod config;
pub mod jobs;
pub mod record_store;
pub mod search;

#[cfg(test)]
mod integration_tests;

pub use config::{BrokerSettings, ConfigError, SearchSettings, Settings, WorkerSettings};
