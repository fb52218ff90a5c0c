use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use newsflow_core::{NewRecord, Record, RecordId};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("record store query failed: {0}")]
    Query(String),

    #[error("stored row is invalid: {0}")]
    InvalidRow(String),
}

#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Look up a record. `Ok(None)` when no record has that id.
    async fn find_by_id(&self, id: RecordId) -> StoreResult<Option<Record>>;

    /// Persist a validated record and return it with its assigned id.
    async fn insert(&self, record: NewRecord) -> StoreResult<Record>;
}

#[async_trait]
impl<S> RecordStore for Arc<S>
where
    S: RecordStore + ?Sized,
{
    async fn find_by_id(&self, id: RecordId) -> StoreResult<Option<Record>> {
        (**self).find_by_id(id).await
    }

    async fn insert(&self, record: NewRecord) -> StoreResult<Record> {
        (**self).insert(record).await
    }
}
