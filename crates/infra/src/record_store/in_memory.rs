use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use newsflow_core::{NewRecord, Record, RecordId};

use super::r#trait::{RecordStore, StoreError, StoreResult};

/// In-memory record store.
///
/// Intended for tests/dev. Ids are assigned sequentially from 1.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<BTreeMap<RecordId, Record>>,
    failing_lookups: AtomicU32,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `record` as-is, keeping its id (seeding fixtures).
    pub fn put(&self, record: Record) {
        if let Ok(mut map) = self.records.write() {
            map.insert(record.id, record);
        }
    }

    /// Make the next `count` lookups fail as if the store were down.
    pub fn fail_next_lookups(&self, count: u32) {
        self.failing_lookups.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn find_by_id(&self, id: RecordId) -> StoreResult<Option<Record>> {
        if self.take_injected_failure() {
            return Err(StoreError::Unavailable("lookup failed (injected)".to_string()));
        }
        let map = self
            .records
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(map.get(&id).cloned())
    }

    async fn insert(&self, record: NewRecord) -> StoreResult<Record> {
        let mut map = self
            .records
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        let next = map.keys().next_back().map_or(1, |id| id.as_i64() + 1);
        let stored = record.into_record(RecordId::new(next), Utc::now());
        map.insert(stored.id, stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_record(title: &str) -> NewRecord {
        NewRecord {
            title: title.to_string(),
            content: "body".to_string(),
            author: "author".to_string(),
            source: "wire".to_string(),
        }
    }

    #[tokio::test]
    async fn insert_assigns_sequential_ids() {
        let store = InMemoryRecordStore::new();
        let a = store.insert(new_record("a")).await.unwrap();
        let b = store.insert(new_record("b")).await.unwrap();

        assert_eq!(a.id, RecordId::new(1));
        assert_eq!(b.id, RecordId::new(2));
        assert_eq!(store.find_by_id(b.id).await.unwrap().unwrap().title, "b");
    }

    #[tokio::test]
    async fn missing_record_is_none() {
        let store = InMemoryRecordStore::new();
        assert_eq!(store.find_by_id(RecordId::new(99)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_one_per_lookup() {
        let store = InMemoryRecordStore::new();
        store.fail_next_lookups(1);

        assert!(store.find_by_id(RecordId::new(1)).await.is_err());
        assert!(store.find_by_id(RecordId::new(1)).await.is_ok());
    }
}
