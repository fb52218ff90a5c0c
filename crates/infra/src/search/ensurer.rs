//! Idempotent index provisioning.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::{IndexSchema, SearchIndex, SearchIndexError, SearchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The index was already there.
    Present,
    /// This call created it.
    Created,
    /// Another caller created it between our check and our create.
    CreatedConcurrently,
}

/// Check-then-create for the search index.
///
/// Safe to call repeatedly and from several processes at once: losing the
/// create race is reported as [`EnsureOutcome::CreatedConcurrently`].
#[derive(Clone)]
pub struct IndexEnsurer {
    index: Arc<dyn SearchIndex>,
    name: String,
    schema: IndexSchema,
}

impl IndexEnsurer {
    pub fn new(index: Arc<dyn SearchIndex>, name: impl Into<String>, schema: IndexSchema) -> Self {
        Self {
            index,
            name: name.into(),
            schema,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(index = %self.name))]
    pub async fn ensure_index(&self) -> SearchResult<EnsureOutcome> {
        if self.index.index_exists(&self.name).await? {
            debug!("search index present");
            return Ok(EnsureOutcome::Present);
        }

        match self.index.create_index(&self.name, &self.schema).await {
            Ok(()) => {
                info!("search index created");
                Ok(EnsureOutcome::Created)
            }
            Err(SearchIndexError::AlreadyExists(_)) => {
                debug!("search index created by another caller");
                Ok(EnsureOutcome::CreatedConcurrently)
            }
            Err(err) => Err(err),
        }
    }
}

impl core::fmt::Debug for IndexEnsurer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IndexEnsurer")
            .field("name", &self.name)
            .finish()
    }
}
