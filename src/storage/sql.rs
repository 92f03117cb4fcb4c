// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL storage backend for the primary store.
//!
//! Works against MySQL or SQLite through sqlx's `Any` driver:
//! ```sql
//! CREATE TABLE records (
//!   id VARCHAR(255) PRIMARY KEY,
//!   kind VARCHAR(128) NOT NULL,
//!   payload LONGTEXT NOT NULL,   -- JSON as text (sqlx Any driver limitation)
//!   content_hash VARCHAR(64) NOT NULL,
//!   created_at BIGINT NOT NULL,
//!   updated_at BIGINT NOT NULL
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver treats MySQL LONGTEXT/TEXT as BLOB, so text columns are
//! read as `String` first and as `Vec<u8>` second (see [`text_column`]).
//! Records read from the primary are by definition synced.

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;

use super::traits::{RecordStore, StorageError};
use crate::filter::RecordFilter;
use crate::record::{Record, SyncState};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Read a text column, tolerating drivers that hand TEXT back as bytes.
pub(crate) fn text_column(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

/// Parse the columns common to both SQL backends into a record.
pub(crate) fn row_to_record(row: &AnyRow) -> Result<Record, StorageError> {
    let id = text_column(row, "id")
        .ok_or_else(|| StorageError::Backend("Row without id".to_string()))?;
    let kind = text_column(row, "kind").unwrap_or_default();
    let payload_str = text_column(row, "payload").ok_or_else(|| StorageError::Corruption {
        id: id.clone(),
        detail: "missing payload".to_string(),
    })?;
    let payload: serde_json::Value =
        serde_json::from_str(&payload_str).map_err(|e| StorageError::Corruption {
            id: id.clone(),
            detail: format!("payload is not valid JSON: {}", e),
        })?;
    let stored_hash = text_column(row, "content_hash").unwrap_or_default();
    let content_hash = Record::compute_hash(&kind, &payload);
    if !stored_hash.is_empty() && stored_hash != content_hash {
        return Err(StorageError::Corruption {
            id,
            detail: format!("expected hash {}, got {}", stored_hash, content_hash),
        });
    }

    Ok(Record {
        id,
        kind,
        payload,
        created_at: row.try_get("created_at").unwrap_or(0),
        updated_at: row.try_get("updated_at").unwrap_or(0),
        sync_state: SyncState::Synced,
        sync_attempts: 0,
        last_attempt_at: None,
        content_hash,
    })
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Create a new SQL store with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 4 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(StorageError::from)
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            sqlx::query("PRAGMA journal_mode = WAL")
                .execute(&store.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS records (
                    id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    content_hash TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_records_kind_created ON records (kind, created_at)",
            ]
        } else {
            &[r#"
                CREATE TABLE IF NOT EXISTS records (
                    id VARCHAR(255) PRIMARY KEY,
                    kind VARCHAR(128) NOT NULL,
                    payload LONGTEXT NOT NULL,
                    content_hash VARCHAR(64) NOT NULL,
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    INDEX idx_records_kind_created (kind, created_at)
                )
                "#]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(StorageError::from)
            })
            .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl RecordStore for SqlStore {
    fn name(&self) -> &str {
        if self.is_sqlite {
            "sqlite"
        } else {
            "mysql"
        }
    }

    async fn insert(&self, record: &Record) -> Result<String, StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO records (id, kind, payload, content_hash, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                payload = excluded.payload,
                content_hash = excluded.content_hash,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at"
        } else {
            "INSERT INTO records (id, kind, payload, content_hash, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                kind = VALUES(kind),
                payload = VALUES(payload),
                content_hash = VALUES(content_hash),
                created_at = VALUES(created_at),
                updated_at = VALUES(updated_at)"
        };

        // Stored hash always describes the stored payload
        let content_hash = Record::compute_hash(&record.kind, &record.payload);
        sqlx::query(sql)
            .bind(&record.id)
            .bind(&record.kind)
            .bind(record.payload.to_string())
            .bind(&content_hash)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&self.pool)
            .await?;

        Ok(record.id.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<Record>, StorageError> {
        let row = sqlx::query(
            "SELECT id, kind, payload, content_hash, created_at, updated_at FROM records WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<Record>, StorageError> {
        let where_sql = filter.to_sql();
        let mut sql = format!(
            "SELECT id, kind, payload, content_hash, created_at, updated_at FROM records{} ORDER BY created_at ASC, id ASC",
            where_sql.where_sql()
        );
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = where_sql.bind(sqlx::query(&sql));
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64, StorageError> {
        let where_sql = filter.to_sql();
        let sql = format!("SELECT COUNT(*) as cnt FROM records{}", where_sql.where_sql());

        let row = where_sql.bind(sqlx::query(&sql)).fetch_one(&self.pool).await?;
        let count: i64 = row.try_get("cnt")?;
        Ok(count as u64)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
