//! Primary record store boundary.
//!
//! The pipeline only reads records by id; the API also inserts them.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryRecordStore;
pub use postgres::PostgresRecordStore;
pub use r#trait::{RecordStore, StoreError, StoreResult};
