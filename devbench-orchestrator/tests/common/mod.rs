//! Shared helpers for the orchestrator integration tests.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use devbench_orchestrator::{
    JobScheduler, MemoryStore, OrchestratorConfig, StateStore, StoreError, VmRecord, VmStatus,
};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

/// Helper to create an in-memory test database with migrations
pub async fn create_test_db() -> SqlitePool {
    // A single, never-recycled connection keeps the in-memory database alive.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Write an executable `/bin/sh` script named `provision_vm.sh` into `dir`.
pub fn write_script(dir: &Path, body: &str) -> PathBuf {
    write_executable(dir, "provision_vm.sh", body)
}

pub fn write_executable(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("Failed to write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to make script executable");
    path
}

/// Config pointing at `script` with timeouts short enough for tests.
pub fn test_config(script: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        script_path: script.to_path_buf(),
        working_dir: script.parent().map(Path::to_path_buf),
        helper_path: PathBuf::from("/usr/bin"),
        activate_timeout_secs: 2,
        create_timeout_secs: 10,
        details_tail_lines: 5,
        db_path: PathBuf::from(":memory:"),
    }
}

pub fn memory_scheduler(config: OrchestratorConfig) -> (Arc<MemoryStore>, JobScheduler) {
    let store = Arc::new(MemoryStore::new());
    let scheduler = JobScheduler::new(store.clone(), Arc::new(config));
    (store, scheduler)
}

/// Insert a record in `status` and return it.
pub async fn seed_record(store: &dyn StateStore, name: &str, owner: &str, status: VmStatus) -> VmRecord {
    let mut record = VmRecord::new(name, owner);
    record.status = status;
    store
        .insert_record(&record)
        .await
        .expect("Failed to insert record");
    record
}

/// Poll the store until `check` holds for the record or five seconds pass.
pub async fn wait_for_record<F>(store: &dyn StateStore, id: &str, check: F) -> VmRecord
where
    F: Fn(&VmRecord) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(record) = store.get_record(id).await.expect("store read failed") {
            if check(&record) {
                return record;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("record {} never reached the expected state", id);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Log messages without their timestamps.
pub fn messages(record: &VmRecord) -> Vec<String> {
    record.log.iter().map(|entry| entry.message.clone()).collect()
}

/// A [`MemoryStore`] whose saves take `delay` and are recorded in call order.
pub struct SlowSaveStore {
    inner: MemoryStore,
    delay: Duration,
    saved: Mutex<Vec<VmRecord>>,
}

impl SlowSaveStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
            saved: Mutex::new(Vec::new()),
        }
    }

    /// Every record handed to `save_record`, whether or not it was stored.
    pub fn saved(&self) -> Vec<VmRecord> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl StateStore for SlowSaveStore {
    async fn get_record(&self, id: &str) -> Result<Option<VmRecord>, StoreError> {
        self.inner.get_record(id).await
    }

    async fn save_record(&self, record: &VmRecord) -> Result<(), StoreError> {
        self.saved.lock().unwrap().push(record.clone());
        tokio::time::sleep(self.delay).await;
        self.inner.save_record(record).await
    }

    async fn insert_record(&self, record: &VmRecord) -> Result<(), StoreError> {
        self.inner.insert_record(record).await
    }

    async fn list_records(&self, owner: Option<&str>) -> Result<Vec<VmRecord>, StoreError> {
        self.inner.list_records(owner).await
    }

    async fn delete_record(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete_record(id).await
    }
}
