//! Search-index representation of a record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::Record;

/// Fields written for each document. Always written as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFields {
    pub title: String,
    pub content: String,
    pub author: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// One document per record, keyed by the record id.
///
/// Writing the same document twice must leave the index in the same state,
/// so adapters treat this as a full replace, never a partial update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub id: String,
    pub fields: DocumentFields,
}

impl IndexDocument {
    pub fn from_record(record: &Record) -> Self {
        Self {
            id: record.id.document_id(),
            fields: DocumentFields {
                title: record.title.clone(),
                content: record.content.clone(),
                author: record.author.clone(),
                source: record.source.clone(),
                created_at: record.created_at,
            },
        }
    }
}

impl From<&Record> for IndexDocument {
    fn from(record: &Record) -> Self {
        Self::from_record(record)
    }
}
