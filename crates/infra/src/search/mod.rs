//! Search index boundary.
//!
//! Documents are keyed by record id and always written whole, so replaying
//! the same write converges to the same index state.

pub mod elasticsearch;
pub mod ensurer;
pub mod in_memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue, json};
use thiserror::Error;

use newsflow_core::{DocumentFields, IndexDocument};

pub use elasticsearch::ElasticsearchIndex;
pub use ensurer::{EnsureOutcome, IndexEnsurer};
pub use in_memory::InMemorySearchIndex;

pub type SearchResult<T> = Result<T, SearchIndexError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SearchIndexError {
    #[error("index {0} already exists")]
    AlreadyExists(String),

    #[error("index {0} does not exist")]
    MissingIndex(String),

    #[error("search request failed: {0}")]
    Request(String),

    #[error("search backend returned {status}: {body}")]
    Response { status: u16, body: String },

    #[error("unexpected search response: {0}")]
    Decode(String),
}

/// Field types the index understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Analyzed full text.
    Text,
    /// Exact-match string.
    Keyword,
    Date,
}

/// Field mapping applied when an index is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    fields: Vec<(String, FieldKind)>,
}

impl IndexSchema {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push((name.into(), kind));
        self
    }

    /// Mapping for news documents.
    pub fn news() -> Self {
        Self::new()
            .field("title", FieldKind::Text)
            .field("content", FieldKind::Text)
            .field("author", FieldKind::Keyword)
            .field("source", FieldKind::Keyword)
            .field("created_at", FieldKind::Date)
    }

    pub fn fields(&self) -> &[(String, FieldKind)] {
        &self.fields
    }

    pub fn kind_of(&self, name: &str) -> Option<FieldKind> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, kind)| *kind)
    }

    /// `{"mappings": {"properties": {...}}}` body for index creation.
    pub fn to_mappings(&self) -> JsonValue {
        let properties: Map<String, JsonValue> = self
            .fields
            .iter()
            .map(|(name, kind)| (name.clone(), json!({ "type": kind })))
            .collect();
        json!({ "mappings": { "properties": properties } })
    }
}

impl Default for IndexSchema {
    fn default() -> Self {
        Self::new()
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: Option<f64>,
    pub document: DocumentFields,
}

#[async_trait]
pub trait SearchIndex: Send + Sync + 'static {
    async fn index_exists(&self, index: &str) -> SearchResult<bool>;

    /// Create `index`. Fails with [`SearchIndexError::AlreadyExists`] if it is there.
    async fn create_index(&self, index: &str, schema: &IndexSchema) -> SearchResult<()>;

    /// Full-document create-or-replace keyed by `document.id`.
    async fn upsert_document(&self, index: &str, document: &IndexDocument) -> SearchResult<()>;

    /// Full-text match over `title` and `content`.
    async fn search(&self, index: &str, query: &str) -> SearchResult<Vec<SearchHit>>;
}

#[async_trait]
impl<S> SearchIndex for Arc<S>
where
    S: SearchIndex + ?Sized,
{
    async fn index_exists(&self, index: &str) -> SearchResult<bool> {
        (**self).index_exists(index).await
    }

    async fn create_index(&self, index: &str, schema: &IndexSchema) -> SearchResult<()> {
        (**self).create_index(index, schema).await
    }

    async fn upsert_document(&self, index: &str, document: &IndexDocument) -> SearchResult<()> {
        (**self).upsert_document(index, document).await
    }

    async fn search(&self, index: &str, query: &str) -> SearchResult<Vec<SearchHit>> {
        (**self).search(index, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn news_schema_maps_field_types() {
        let mappings = IndexSchema::news().to_mappings();
        let props = &mappings["mappings"]["properties"];

        assert_eq!(props["title"]["type"], "text");
        assert_eq!(props["content"]["type"], "text");
        assert_eq!(props["author"]["type"], "keyword");
        assert_eq!(props["source"]["type"], "keyword");
        assert_eq!(props["created_at"]["type"], "date");
    }
}
