//! Durable task source
//!
//! Records of IDLs and repositories that should currently be synced. The
//! coordination manager pages through them to add missing tasks and drop
//! tasks whose record is gone; the task admin endpoints write them.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::error::Result;
use crate::store::{SharedStore, SOURCE_RECORD_PREFIX};
use crate::task::{TaskKey, TaskPayload};

/// Records per page
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// A record that needs a recurring sync task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    /// Stable id of the record
    pub id: i64,
    pub payload: TaskPayload,
}

/// One page of pending records
#[derive(Debug, Clone, Default)]
pub struct SourcePage {
    pub records: Vec<SyncRecord>,
    /// Total number of pending records across all pages
    pub total: usize,
}

/// Paged listing of records pending sync
#[async_trait::async_trait]
pub trait TaskSource: Send + Sync {
    /// `page` is 1-based
    async fn pending_sync_tasks(&self, page: usize) -> Result<SourcePage>;

    /// Insert or replace the record for `record.payload`
    async fn put_record(&self, record: SyncRecord) -> Result<()>;

    /// Drop the record behind `key`; absent records are ignored
    async fn remove_record(&self, key: &TaskKey) -> Result<()>;
}

impl SyncRecord {
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            id: payload.key().id,
            payload,
        }
    }
}

/// In-memory source, for single-process deployments and tests
#[derive(Clone)]
pub struct StaticTaskSource {
    records: Arc<RwLock<Vec<SyncRecord>>>,
    page_size: usize,
}

impl StaticTaskSource {
    pub fn new(records: Vec<SyncRecord>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn push(&self, record: SyncRecord) {
        self.records.write().push(record);
    }

    pub fn remove(&self, id: i64) {
        self.records.write().retain(|r| r.id != id);
    }
}

impl Default for StaticTaskSource {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait::async_trait]
impl TaskSource for StaticTaskSource {
    async fn pending_sync_tasks(&self, page: usize) -> Result<SourcePage> {
        let records = self.records.read();
        let page_size = self.page_size.max(1);
        let start = page.saturating_sub(1).saturating_mul(page_size);
        Ok(SourcePage {
            records: records.iter().skip(start).take(page_size).cloned().collect(),
            total: records.len(),
        })
    }

    async fn put_record(&self, record: SyncRecord) -> Result<()> {
        let key = record.payload.key();
        let mut records = self.records.write();
        records.retain(|r| r.payload.key() != key);
        records.push(record);
        Ok(())
    }

    async fn remove_record(&self, key: &TaskKey) -> Result<()> {
        self.records.write().retain(|r| r.payload.key() != *key);
        Ok(())
    }
}

/// Records kept in the shared store, visible to every API replica
pub struct StoreTaskSource {
    store: Arc<dyn SharedStore>,
    page_size: usize,
}

impl StoreTaskSource {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn record_key(key: &TaskKey) -> String {
        format!("{SOURCE_RECORD_PREFIX}{key}")
    }
}

#[async_trait::async_trait]
impl TaskSource for StoreTaskSource {
    async fn pending_sync_tasks(&self, page: usize) -> Result<SourcePage> {
        let keys = self.store.scan_prefix(SOURCE_RECORD_PREFIX).await?;
        let start = page.saturating_sub(1).saturating_mul(self.page_size);
        let window: Vec<String> = keys.iter().skip(start).take(self.page_size).cloned().collect();
        let values = self.store.mget(&window).await?;

        let mut records = Vec::with_capacity(window.len());
        for (key, value) in window.iter().zip(values) {
            // Deleted between scan and read
            let Some(raw) = value else { continue };
            match serde_json::from_str::<TaskPayload>(&raw) {
                Ok(payload) => records.push(SyncRecord::new(payload)),
                Err(e) => warn!("Skipping malformed sync record {}: {}", key, e),
            }
        }

        Ok(SourcePage {
            records,
            total: keys.len(),
        })
    }

    async fn put_record(&self, record: SyncRecord) -> Result<()> {
        let value = serde_json::to_string(&record.payload)?;
        self.store
            .set(&Self::record_key(&record.payload.key()), &value)
            .await
    }

    async fn remove_record(&self, key: &TaskKey) -> Result<()> {
        self.store.del(&Self::record_key(key)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::task::TaskType;

    #[tokio::test]
    async fn test_static_source_pages() {
        let source = StaticTaskSource::new(
            (1..=5)
                .map(|id| SyncRecord {
                    id,
                    payload: TaskPayload::SyncIdl { idl_id: id },
                })
                .collect(),
        )
        .with_page_size(2);

        let first = source.pending_sync_tasks(1).await.unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.records.len(), 2);

        let last = source.pending_sync_tasks(3).await.unwrap();
        assert_eq!(last.records.len(), 1);
        assert_eq!(last.records[0].id, 5);

        assert!(source.pending_sync_tasks(4).await.unwrap().records.is_empty());
    }

    #[tokio::test]
    async fn test_store_source_round_trips_records() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let source = StoreTaskSource::new(store.clone()).with_page_size(2);
        for repo_id in 1..=3 {
            source
                .put_record(SyncRecord::new(TaskPayload::SyncRepo { repo_id }))
                .await
                .unwrap();
        }
        source
            .put_record(SyncRecord::new(TaskPayload::SyncRepo { repo_id: 2 }))
            .await
            .unwrap();
        store
            .set(&format!("{SOURCE_RECORD_PREFIX}sync_idl:9"), "{broken")
            .await
            .unwrap();

        let first = source.pending_sync_tasks(1).await.unwrap();
        let second = source.pending_sync_tasks(2).await.unwrap();
        assert_eq!(first.total, 4);
        let mut ids: Vec<i64> = first
            .records
            .iter()
            .chain(second.records.iter())
            .map(|r| r.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);

        source
            .remove_record(&TaskKey::new(TaskType::SyncRepo, 2))
            .await
            .unwrap();
        assert_eq!(source.pending_sync_tasks(1).await.unwrap().total, 3);
    }
}
