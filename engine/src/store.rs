//! Local store - the authoritative per-table persistence seam.
//!
//! The engine only talks to storage through [`LocalStore`]. [`MemoryStore`]
//! is an in-process implementation used by the host binary and by tests.

use crate::{error::Result, Error, Record, RecordId, TableId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Per-table CRUD interface of the local persistent store.
///
/// Implementations must accept concurrent calls across tables.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get a record by ID.
    async fn get(&self, table: TableId, id: &str) -> Result<Option<Record>>;

    /// Insert a new record.
    async fn add(&self, table: TableId, record: Record) -> Result<()>;

    /// Replace the payload of a record.
    async fn update(&self, table: TableId, id: &str, payload: serde_json::Value) -> Result<()>;

    /// Remove a record. Removing an absent record succeeds.
    async fn delete(&self, table: TableId, id: &str) -> Result<()>;

    /// All records of a table, in a stable order.
    async fn to_array(&self, table: TableId) -> Result<Vec<Record>>;
}

/// Records of one table, ordered by ID.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    records: BTreeMap<RecordId, serde_json::Value>,
}

impl Collection {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }

    /// Get a record by ID.
    pub fn get(&self, id: &str) -> Option<Record> {
        self.records
            .get(id)
            .map(|payload| Record::new(id, payload.clone()))
    }

    /// Insert or replace a record.
    pub fn insert(&mut self, record: Record) {
        self.records.insert(record.id, record.payload);
    }

    /// Check if a record exists.
    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Remove a record, returning whether it existed.
    pub fn remove(&mut self, id: &str) -> bool {
        self.records.remove(id).is_some()
    }

    /// All records in ID order.
    pub fn records(&self) -> Vec<Record> {
        self.records
            .iter()
            .map(|(id, payload)| Record::new(id.clone(), payload.clone()))
            .collect()
    }

    /// Count of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if collection is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// In-memory [`LocalStore`].
///
/// Each table is locked independently. Once [`MemoryStore::close`] has been
/// called every operation fails with [`Error::StoreClosed`], which mimics a
/// store torn down underneath in-flight writes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: DashMap<TableId, Collection>,
    writes: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert records directly, bypassing write accounting.
    pub fn seed(&self, table: TableId, records: impl IntoIterator<Item = Record>) {
        let mut collection = self.tables.entry(table).or_default();
        for record in records {
            collection.insert(record);
        }
    }

    /// Snapshot of one record.
    pub fn record(&self, table: TableId, id: &str) -> Option<Record> {
        self.tables.get(&table).and_then(|c| c.get(id))
    }

    /// Number of records in a table.
    pub fn len(&self, table: TableId) -> usize {
        self.tables.get(&table).map(|c| c.len()).unwrap_or(0)
    }

    /// Check if a table is empty.
    pub fn is_empty(&self, table: TableId) -> bool {
        self.len(table) == 0
    }

    /// Number of successful add/update/delete calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Close the store. Subsequent calls fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::StoreClosed);
        }
        Ok(())
    }

    fn count_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, table: TableId, id: &str) -> Result<Option<Record>> {
        self.ensure_open()?;
        Ok(self.record(table, id))
    }

    async fn add(&self, table: TableId, record: Record) -> Result<()> {
        self.ensure_open()?;
        let mut collection = self.tables.entry(table).or_default();
        if collection.contains(&record.id) {
            return Err(Error::Store {
                id: record.id,
                message: "record already exists".into(),
            });
        }
        collection.insert(record);
        self.count_write();
        Ok(())
    }

    async fn update(&self, table: TableId, id: &str, payload: serde_json::Value) -> Result<()> {
        self.ensure_open()?;
        let mut collection = self.tables.entry(table).or_default();
        collection.insert(Record::new(id, payload));
        self.count_write();
        Ok(())
    }

    async fn delete(&self, table: TableId, id: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some(mut collection) = self.tables.get_mut(&table) {
            if collection.remove(id) {
                self.count_write();
            }
        }
        Ok(())
    }

    async fn to_array(&self, table: TableId) -> Result<Vec<Record>> {
        self.ensure_open()?;
        Ok(self
            .tables
            .get(&table)
            .map(|c| c.records())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn add_get_update_delete() {
        let store = MemoryStore::new();
        store
            .add(TableId::Topics, Record::new("t1", json!({"title": "a"})))
            .await
            .unwrap();
        assert_eq!(store.len(TableId::Topics), 1);

        store
            .update(TableId::Topics, "t1", json!({"title": "b"}))
            .await
            .unwrap();
        let record = store.get(TableId::Topics, "t1").await.unwrap().unwrap();
        assert_eq!(record.payload["title"], "b");

        store.delete(TableId::Topics, "t1").await.unwrap();
        assert!(store.get(TableId::Topics, "t1").await.unwrap().is_none());
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test]
    async fn add_duplicate_fails() {
        let store = MemoryStore::new();
        store.seed(TableId::Topics, [Record::new("t1", json!({}))]);
        let err = store
            .add(TableId::Topics, Record::new("t1", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store { .. }));
    }

    #[tokio::test]
    async fn delete_absent_is_ok() {
        let store = MemoryStore::new();
        store.delete(TableId::Plugins, "missing").await.unwrap();
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn to_array_is_ordered_by_id() {
        let store = MemoryStore::new();
        store.seed(
            TableId::Messages,
            [
                Record::new("b", json!(2)),
                Record::new("a", json!(1)),
                Record::new("c", json!(3)),
            ],
        );
        let ids: Vec<_> = store
            .to_array(TableId::Messages)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn closed_store_rejects_calls() {
        let store = MemoryStore::new();
        store.close();
        assert_eq!(
            store.get(TableId::Messages, "x").await.unwrap_err(),
            Error::StoreClosed
        );
        assert_eq!(
            store.to_array(TableId::Messages).await.unwrap_err(),
            Error::StoreClosed
        );
    }
}
