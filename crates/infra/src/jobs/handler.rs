//! Indexing of one job: record lookup then document upsert.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use newsflow_core::{IndexDocument, Job};

use crate::record_store::{RecordStore, StoreError};
use crate::search::{SearchIndex, SearchIndexError};

/// Successful outcomes; both end with an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The record's document was written.
    Indexed,
    /// The record no longer exists (or never did); nothing to index.
    RecordMissing,
}

/// A failed attempt. Every variant is retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("record lookup failed: {0}")]
    Store(#[from] StoreError),

    #[error("index write failed: {0}")]
    Index(#[from] SearchIndexError),
}

/// Stateless: any number of jobs may run through one handler concurrently.
#[derive(Clone)]
pub struct JobHandler {
    store: Arc<dyn RecordStore>,
    index: Arc<dyn SearchIndex>,
    index_name: String,
}

impl JobHandler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        index: Arc<dyn SearchIndex>,
        index_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            index,
            index_name: index_name.into(),
        }
    }

    #[instrument(skip(self), fields(record_id = %job.record_id(), attempts = job.attempts()))]
    pub async fn handle(&self, job: &Job) -> Result<JobOutcome, JobError> {
        let Some(record) = self.store.find_by_id(job.record_id()).await? else {
            info!("record not found, skipping");
            return Ok(JobOutcome::RecordMissing);
        };

        let document = IndexDocument::from_record(&record);
        self.index
            .upsert_document(&self.index_name, &document)
            .await?;
        debug!(index = %self.index_name, "document indexed");
        Ok(JobOutcome::Indexed)
    }
}

impl core::fmt::Debug for JobHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobHandler")
            .field("index_name", &self.index_name)
            .finish()
    }
}
