use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use newsflow_core::{DocumentFields, IndexDocument};

use super::{IndexSchema, SearchHit, SearchIndex, SearchIndexError, SearchResult};

#[derive(Debug)]
struct StoredIndex {
    schema: IndexSchema,
    documents: BTreeMap<String, DocumentFields>,
}

/// In-memory search index for tests/dev.
///
/// Search is a case-insensitive substring match over `title` and `content`.
#[derive(Debug, Default)]
pub struct InMemorySearchIndex {
    indices: RwLock<HashMap<String, StoredIndex>>,
    creates: AtomicU32,
    writes: AtomicU32,
    failing_writes: AtomicU32,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` document writes fail.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of successful index creations.
    pub fn create_count(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of successful document writes (replays included).
    pub fn write_count(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn schema(&self, index: &str) -> Option<IndexSchema> {
        let map = self.indices.read().ok()?;
        map.get(index).map(|i| i.schema.clone())
    }

    pub fn document(&self, index: &str, id: &str) -> Option<DocumentFields> {
        let map = self.indices.read().ok()?;
        map.get(index)?.documents.get(id).cloned()
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.indices
            .read()
            .ok()
            .and_then(|map| map.get(index).map(|i| i.documents.len()))
            .unwrap_or(0)
    }

    fn poisoned() -> SearchIndexError {
        SearchIndexError::Request("lock poisoned".to_string())
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn index_exists(&self, index: &str) -> SearchResult<bool> {
        let map = self.indices.read().map_err(|_| Self::poisoned())?;
        Ok(map.contains_key(index))
    }

    async fn create_index(&self, index: &str, schema: &IndexSchema) -> SearchResult<()> {
        let mut map = self.indices.write().map_err(|_| Self::poisoned())?;
        if map.contains_key(index) {
            return Err(SearchIndexError::AlreadyExists(index.to_string()));
        }
        map.insert(
            index.to_string(),
            StoredIndex {
                schema: schema.clone(),
                documents: BTreeMap::new(),
            },
        );
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn upsert_document(&self, index: &str, document: &IndexDocument) -> SearchResult<()> {
        if self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SearchIndexError::Request("index unavailable (injected)".to_string()));
        }

        let mut map = self.indices.write().map_err(|_| Self::poisoned())?;
        let stored = map
            .get_mut(index)
            .ok_or_else(|| SearchIndexError::MissingIndex(index.to_string()))?;
        stored
            .documents
            .insert(document.id.clone(), document.fields.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn search(&self, index: &str, query: &str) -> SearchResult<Vec<SearchHit>> {
        let map = self.indices.read().map_err(|_| Self::poisoned())?;
        let stored = map
            .get(index)
            .ok_or_else(|| SearchIndexError::MissingIndex(index.to_string()))?;

        let needle = query.to_lowercase();
        Ok(stored
            .documents
            .iter()
            .filter(|(_, doc)| {
                doc.title.to_lowercase().contains(&needle)
                    || doc.content.to_lowercase().contains(&needle)
            })
            .map(|(id, doc)| SearchHit {
                id: id.clone(),
                score: None,
                document: doc.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn doc(id: &str, title: &str) -> IndexDocument {
        IndexDocument {
            id: id.to_string(),
            fields: DocumentFields {
                title: title.to_string(),
                content: "content".to_string(),
                author: "a".to_string(),
                source: "s".to_string(),
                created_at: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn create_twice_reports_already_exists() {
        let index = InMemorySearchIndex::new();
        index.create_index("news", &IndexSchema::news()).await.unwrap();

        let err = index
            .create_index("news", &IndexSchema::news())
            .await
            .unwrap_err();
        assert_eq!(err, SearchIndexError::AlreadyExists("news".to_string()));
        assert_eq!(index.create_count(), 1);
    }

    #[tokio::test]
    async fn upsert_replaces_whole_document() {
        let index = InMemorySearchIndex::new();
        index.create_index("news", &IndexSchema::news()).await.unwrap();

        index.upsert_document("news", &doc("1", "first")).await.unwrap();
        index.upsert_document("news", &doc("1", "second")).await.unwrap();

        assert_eq!(index.document_count("news"), 1);
        assert_eq!(index.document("news", "1").unwrap().title, "second");
    }

    #[tokio::test]
    async fn writes_to_missing_index_fail() {
        let index = InMemorySearchIndex::new();
        let err = index.upsert_document("news", &doc("1", "t")).await.unwrap_err();
        assert!(matches!(err, SearchIndexError::MissingIndex(_)));
    }

    #[tokio::test]
    async fn search_matches_title_case_insensitively() {
        let index = InMemorySearchIndex::new();
        index.create_index("news", &IndexSchema::news()).await.unwrap();
        index.upsert_document("news", &doc("1", "Rates Held")).await.unwrap();
        index.upsert_document("news", &doc("2", "Weather")).await.unwrap();

        let hits = index.search("news", "rates").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "1");
    }
}
