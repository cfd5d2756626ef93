use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{instrument, warn};

use crate::model::{LogEntry, VmRecord, VmStatus};
use crate::store::{StateStore, StoreError};

/// [`StateStore`] backed by the `devbenches` table.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl StateStore for SqliteStore {
    async fn get_record(&self, id: &str) -> Result<Option<VmRecord>, StoreError> {
        let row = sqlx::query_as::<_, DevbenchRow>("SELECT * FROM devbenches WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, record), fields(vm_id = %record.id))]
    async fn save_record(&self, record: &VmRecord) -> Result<(), StoreError> {
        let log = serde_json::to_string(&record.log)?;

        let result = sqlx::query(
            "UPDATE devbenches
             SET name = ?, owner = ?, status = ?, details = ?, log = ?,
                 ip_address = ?, ssh_info = ?, vnc_info = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&record.name)
        .bind(&record.owner)
        .bind(record.status)
        .bind(&record.details)
        .bind(log)
        .bind(&record.ip_address)
        .bind(&record.ssh_info)
        .bind(&record.vnc_info)
        .bind(record.updated_at.timestamp())
        .bind(&record.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(record.id.clone()));
        }

        Ok(())
    }

    #[instrument(skip(self, record), fields(vm_id = %record.id))]
    async fn insert_record(&self, record: &VmRecord) -> Result<(), StoreError> {
        let log = serde_json::to_string(&record.log)?;

        sqlx::query(
            r#"
            INSERT INTO devbenches (id, name, owner, status, details, log, ip_address, ssh_info, vnc_info, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.owner)
        .bind(record.status)
        .bind(&record.details)
        .bind(log)
        .bind(&record.ip_address)
        .bind(&record.ssh_info)
        .bind(&record.vnc_info)
        .bind(record.created_at.timestamp())
        .bind(record.updated_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_records(&self, owner: Option<&str>) -> Result<Vec<VmRecord>, StoreError> {
        let mut query = "SELECT * FROM devbenches WHERE 1=1".to_string();

        if owner.is_some() {
            query.push_str(" AND owner = ?");
        }

        query.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query_as::<_, DevbenchRow>(&query);

        if let Some(owner) = owner {
            q = q.bind(owner);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_record(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM devbenches WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        Ok(())
    }
}

// Internal row type for sqlx
#[derive(sqlx::FromRow)]
struct DevbenchRow {
    id: String,
    name: String,
    owner: String,
    status: VmStatus,
    details: Option<String>,
    log: String,
    ip_address: Option<String>,
    ssh_info: Option<String>,
    vnc_info: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<DevbenchRow> for VmRecord {
    fn from(row: DevbenchRow) -> Self {
        let log: Vec<LogEntry> = serde_json::from_str(&row.log).unwrap_or_else(|e| {
            warn!("Discarding unreadable log for devbench {}: {}", row.id, e);
            Vec::new()
        });

        Self {
            id: row.id,
            name: row.name,
            owner: row.owner,
            status: row.status,
            details: row.details,
            log,
            ip_address: row.ip_address,
            ssh_info: row.ssh_info,
            vnc_info: row.vnc_info,
            created_at: DateTime::<Utc>::from_timestamp(row.created_at, 0).unwrap_or_default(),
            updated_at: DateTime::<Utc>::from_timestamp(row.updated_at, 0).unwrap_or_default(),
        }
    }
}
