//! The boundary between jobs and durable storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use thiserror::Error;

use crate::model::VmRecord;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The record does not exist (or was deleted while a job was running).
    #[error("Devbench not found: {0}")]
    NotFound(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(format!("log encoding: {}", err))
    }
}

/// Persistence for devbench records.
///
/// `save_record` replaces the stored record wholesale and must report
/// [`StoreError::NotFound`] when the record no longer exists, never recreate it.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn get_record(&self, id: &str) -> Result<Option<VmRecord>, StoreError>;

    async fn save_record(&self, record: &VmRecord) -> Result<(), StoreError>;

    async fn insert_record(&self, record: &VmRecord) -> Result<(), StoreError>;

    /// Newest first, optionally restricted to one owner.
    async fn list_records(&self, owner: Option<&str>) -> Result<Vec<VmRecord>, StoreError>;

    async fn delete_record(&self, id: &str) -> Result<(), StoreError>;
}

/// Process-local store, mostly for tests.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, VmRecord>>,
    failing_saves: AtomicUsize,
    failing_gets: AtomicUsize,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` saves fail with a backend error.
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` reads fail with a backend error.
    pub fn fail_next_gets(&self, count: usize) {
        self.failing_gets.store(count, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStore {
    async fn get_record(&self, id: &str) -> Result<Option<VmRecord>, StoreError> {
        if Self::take_failure(&self.failing_gets) {
            return Err(StoreError::Backend("injected read failure".to_string()));
        }

        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(id).cloned())
    }

    async fn save_record(&self, record: &VmRecord) -> Result<(), StoreError> {
        if Self::take_failure(&self.failing_saves) {
            return Err(StoreError::Backend("injected save failure".to_string()));
        }

        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(&record.id) {
            Some(stored) => {
                *stored = record.clone();
                self.saves.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(StoreError::NotFound(record.id.clone())),
        }
    }

    async fn insert_record(&self, record: &VmRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if records.contains_key(&record.id) {
            return Err(StoreError::Backend(format!(
                "devbench {} already exists",
                record.id
            )));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn list_records(&self, owner: Option<&str>) -> Result<Vec<VmRecord>, StoreError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<VmRecord> = records
            .values()
            .filter(|r| owner.map_or(true, |o| r.owner == o))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching)
    }

    async fn delete_record(&self, id: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}
