//! The persistent store interface the repository is written against.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreError;

/// One stored record. Records are opaque JSON objects to the store.
pub type Record = serde_json::Value;

/// Ordered record lists keyed by logical name.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Returns an empty list for unknown keys.
    async fn get_list(&self, key: &str) -> Result<Vec<Record>, StoreError>;
    async fn set_list(&self, key: &str, records: Vec<Record>) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
}

/// Process-local store, used by tests and the loopback demo.
#[derive(Default)]
pub struct MemoryRecordStore {
    lists: Mutex<HashMap<String, Vec<Record>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_list(&self, key: &str) -> Result<Vec<Record>, StoreError> {
        Ok(self.lists.lock().get(key).cloned().unwrap_or_default())
    }

    async fn set_list(&self, key: &str, records: Vec<Record>) -> Result<(), StoreError> {
        self.lists.lock().insert(key.to_owned(), records);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.lists.lock().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.lists.lock().clear();
        Ok(())
    }
}
