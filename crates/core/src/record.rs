//! Records owned by the primary store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::RecordId;

/// Maximum length of the short text columns (`title`, `author`, `source`).
pub const MAX_SHORT_FIELD_LEN: usize = 255;

/// A durable news record as stored in the primary store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub title: String,
    pub content: String,
    pub author: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// A record that has not been persisted yet (no id assigned).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecord {
    pub title: String,
    pub content: String,
    pub author: String,
    pub source: String,
}

impl NewRecord {
    /// Validate and normalize (trim) the payload.
    pub fn validated(self) -> DomainResult<Self> {
        let title = required("title", self.title, Some(MAX_SHORT_FIELD_LEN))?;
        let content = required("content", self.content, None)?;
        let author = required("author", self.author, Some(MAX_SHORT_FIELD_LEN))?;
        let source = required("source", self.source, Some(MAX_SHORT_FIELD_LEN))?;

        Ok(Self {
            title,
            content,
            author,
            source,
        })
    }

    /// Attach the store-assigned identity.
    pub fn into_record(self, id: RecordId, created_at: DateTime<Utc>) -> Record {
        Record {
            id,
            title: self.title,
            content: self.content,
            author: self.author,
            source: self.source,
            created_at,
        }
    }
}

fn required(field: &str, value: String, max_len: Option<usize>) -> DomainResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation(format!("\"{field}\" is required")));
    }
    if let Some(max) = max_len {
        if trimmed.chars().count() > max {
            return Err(DomainError::validation(format!(
                "\"{field}\" must be at most {max} characters"
            )));
        }
    }
    Ok(trimmed.to_string())
}
