// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable fallback store backed by a local SQLite file.
//!
//! While the primary store is unreachable, records are written here tagged
//! `pending`. The drain loop reads them back oldest-first per kind and
//! replays them into the primary, flipping each row to `synced` or, after
//! too many failed attempts, `failed`.
//!
//! This is not a cache: a row stays until an external retention job removes
//! it. The engine only ever changes its sync state.
//!
//! ```sql
//! CREATE TABLE fallback_records (
//!   seq INTEGER PRIMARY KEY AUTOINCREMENT,  -- tie-break for equal created_at
//!   id TEXT NOT NULL UNIQUE,
//!   kind TEXT NOT NULL,
//!   payload TEXT NOT NULL,
//!   content_hash TEXT NOT NULL,
//!   created_at INTEGER NOT NULL,
//!   updated_at INTEGER NOT NULL,
//!   sync_state TEXT NOT NULL,               -- pending | synced | failed
//!   sync_attempts INTEGER NOT NULL,
//!   last_attempt_at INTEGER,
//!   last_error TEXT
//! );
//! CREATE INDEX idx_fallback_pending ON fallback_records (sync_state, kind, created_at, seq);
//! ```

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::sql::{install_drivers, row_to_record, text_column};
use super::traits::{RecordStore, StorageError};
use crate::audit::{AuditFilter, SyncLogEntry, SyncResult};
use crate::filter::RecordFilter;
use crate::record::{now_millis, Record, SyncState};
use crate::resilience::retry::{retry, RetryConfig};

const RECORD_COLUMNS: &str =
    "id, kind, payload, content_hash, created_at, updated_at, sync_state, sync_attempts, last_attempt_at";

/// Counts by sync state, for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallbackStats {
    pub pending: u64,
    pub synced: u64,
    pub failed: u64,
    /// Records written through this handle since it was opened
    pub total_written: u64,
}

/// Result of recording a failed replay attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    /// State after the attempt: `Pending` (will retry) or `Failed`
    pub state: SyncState,
    /// `sync_attempts` after the increment
    pub attempts: u32,
}

/// One pending row as the drain sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingRow {
    Ready(Record),
    /// The row exists but cannot be turned back into a record (bad JSON,
    /// hash mismatch). Retrying will never help.
    Unreadable { id: String, kind: String, detail: String },
}

/// SQLite-backed durable record store.
pub struct FallbackStore {
    pool: AnyPool,
    /// Path to SQLite file (for display)
    path: String,
    total_written: AtomicU64,
}

impl FallbackStore {
    /// Open (or create) the fallback database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        install_drivers();

        let path_str = path.as_ref().to_string_lossy().to_string();
        let url = format!("sqlite://{}?mode=rwc", path_str);

        info!(path = %path_str, "Opening fallback store");

        let pool = retry("fallback_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(4)
                .acquire_timeout(Duration::from_secs(10))
                .after_connect(|conn, _meta| {
                    Box::pin(async move {
                        // Every committed write must survive a crash
                        sqlx::query("PRAGMA synchronous = FULL").execute(&mut *conn).await?;
                        Ok(())
                    })
                })
                .connect(&url)
                .await
                .map_err(StorageError::from)
        })
        .await?;

        let store = Self {
            pool,
            path: path_str,
            total_written: AtomicU64::new(0),
        };
        store.init_schema().await?;

        // Rows left pending by a previous run
        let pending = store.count_pending(None).await.unwrap_or(0);
        if pending > 0 {
            warn!(pending, "Fallback store has pending records from previous run, will drain");
        }

        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = [
            "PRAGMA journal_mode = WAL",
            r#"
            CREATE TABLE IF NOT EXISTS fallback_records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                sync_state TEXT NOT NULL DEFAULT 'pending',
                sync_attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt_at INTEGER,
                last_error TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_fallback_pending ON fallback_records (sync_state, kind, created_at, seq)",
            r#"
            CREATE TABLE IF NOT EXISTS sync_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                result TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                error_detail TEXT,
                attempt INTEGER NOT NULL,
                pass_id TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_sync_log_record ON sync_log (record_id, seq)",
        ];

        for sql in statements {
            retry("fallback_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(StorageError::from)
            })
            .await?;
        }
        Ok(())
    }

    /// Get the path to the SQLite file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get the database file size in bytes.
    pub fn file_size_bytes(&self) -> std::io::Result<u64> {
        std::fs::metadata(&self.path).map(|m| m.len())
    }

    /// Run a WAL checkpoint to reclaim disk space once the queue is empty.
    pub async fn checkpoint(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Fallback checkpoint failed: {}", e)))?;

        debug!(path = %self.path, "Fallback checkpoint completed");
        Ok(())
    }

    fn parse_row(row: &AnyRow) -> Result<Record, StorageError> {
        let mut record = row_to_record(row)?;
        record.sync_state = SyncState::parse(&text_column(row, "sync_state").unwrap_or_default());
        record.sync_attempts = row.try_get::<i64, _>("sync_attempts").unwrap_or(0).max(0) as u32;
        record.last_attempt_at = row.try_get::<Option<i64>, _>("last_attempt_at").ok().flatten();
        Ok(record)
    }

    /// Pending records of one kind, oldest first. Fails on the first row
    /// that cannot be parsed; the drain uses [`pending_rows`](Self::pending_rows).
    pub async fn get_pending(&self, kind: &str, limit: usize) -> Result<Vec<Record>, StorageError> {
        self.pending_rows(kind, limit)
            .await?
            .into_iter()
            .map(|row| match row {
                PendingRow::Ready(record) => Ok(record),
                PendingRow::Unreadable { id, detail, .. } => Err(StorageError::Corruption { id, detail }),
            })
            .collect()
    }

    /// Like [`get_pending`](Self::get_pending), but a row that fails to parse
    /// is returned in place instead of failing the whole batch.
    pub async fn pending_rows(&self, kind: &str, limit: usize) -> Result<Vec<PendingRow>, StorageError> {
        let sql = format!(
            "SELECT {} FROM fallback_records WHERE sync_state = 'pending' AND kind = ? \
             ORDER BY created_at ASC, seq ASC LIMIT ?",
            RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(kind)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut batch = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::parse_row(row) {
                Ok(record) => batch.push(PendingRow::Ready(record)),
                Err(e) => {
                    let id = text_column(row, "id")
                        .ok_or_else(|| StorageError::Backend("Row without id".to_string()))?;
                    let detail = match e {
                        StorageError::Corruption { detail, .. } => detail,
                        other => other.to_string(),
                    };
                    warn!(id = %id, kind, detail = %detail, "Pending row is unreadable");
                    batch.push(PendingRow::Unreadable {
                        id,
                        kind: kind.to_string(),
                        detail,
                    });
                }
            }
        }
        Ok(batch)
    }

    /// Kinds that currently have pending records.
    pub async fn pending_kinds(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query(
            "SELECT DISTINCT kind FROM fallback_records WHERE sync_state = 'pending' ORDER BY kind",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().filter_map(|row| text_column(row, "kind")).collect())
    }

    /// Number of pending records, optionally for one kind.
    pub async fn count_pending(&self, kind: Option<&str>) -> Result<u64, StorageError> {
        let filter = RecordFilter {
            kind: kind.map(str::to_string),
            ..RecordFilter::default()
        }
        .sync_state(SyncState::Pending);
        self.count(&filter).await
    }

    /// Mark a record synced.
    pub async fn mark_synced(&self, id: &str) -> Result<bool, StorageError> {
        self.set_sync_state(id, SyncState::Synced).await
    }

    /// Mark a record permanently failed, excluding it from automatic drains.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE fallback_records SET sync_state = 'failed', last_error = ? WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Finish a successful replay: rewrite the row to the version now held by
    /// the primary, flip it to `synced` and append a success entry, all in
    /// one transaction.
    ///
    /// The update only applies while the row still holds the exact version
    /// that was replayed. If a producer re-inserted the record meanwhile,
    /// nothing changes and `false` is returned; the newer version stays
    /// pending.
    pub async fn complete_sync(
        &self,
        replayed: &Record,
        resolved: &Record,
        pass_id: &str,
    ) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE fallback_records SET \
                kind = ?, payload = ?, content_hash = ?, created_at = ?, updated_at = ?, \
                sync_state = 'synced', last_error = NULL \
             WHERE id = ? AND content_hash = ? AND updated_at = ? AND sync_state = 'pending'",
        )
        .bind(&resolved.kind)
        .bind(resolved.payload.to_string())
        .bind(Record::compute_hash(&resolved.kind, &resolved.payload))
        .bind(resolved.created_at)
        .bind(resolved.updated_at)
        .bind(&replayed.id)
        .bind(&replayed.content_hash)
        .bind(replayed.updated_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let entry = SyncLogEntry::new(replayed, SyncResult::Success, pass_id);
        Self::insert_log_entry(&mut tx, &entry).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Record a failed replay: bump `sync_attempts`, stamp `last_attempt_at`,
    /// flip to `failed` once `max_attempts` is reached, and append a failure
    /// entry. Returns `None` when the row is no longer pending.
    pub async fn record_sync_failure(
        &self,
        record: &Record,
        error: &str,
        max_attempts: u32,
        pass_id: &str,
    ) -> Result<Option<FailureOutcome>, StorageError> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE fallback_records SET \
                sync_attempts = sync_attempts + 1, \
                last_attempt_at = ?, \
                last_error = ?, \
                sync_state = CASE WHEN sync_attempts + 1 >= ? THEN 'failed' ELSE 'pending' END \
             WHERE id = ? AND sync_state = 'pending'",
        )
        .bind(now)
        .bind(error)
        .bind(i64::from(max_attempts))
        .bind(&record.id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let row = sqlx::query("SELECT sync_state, sync_attempts FROM fallback_records WHERE id = ?")
            .bind(&record.id)
            .fetch_one(&mut *tx)
            .await?;
        let state = SyncState::parse(&text_column(&row, "sync_state").unwrap_or_default());
        let attempts = row.try_get::<i64, _>("sync_attempts").unwrap_or(0).max(0) as u32;

        let entry = SyncLogEntry::new(record, SyncResult::Failed, pass_id)
            .with_attempt(attempts)
            .with_error(error);
        Self::insert_log_entry(&mut tx, &entry).await?;
        tx.commit().await?;

        Ok(Some(FailureOutcome { state, attempts }))
    }

    /// Mark an unreadable pending row `failed` straight away and append a
    /// failure entry. Returns `None` when the row is no longer pending.
    pub async fn fail_unreadable(
        &self,
        id: &str,
        kind: &str,
        detail: &str,
        pass_id: &str,
    ) -> Result<Option<FailureOutcome>, StorageError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE fallback_records SET \
                sync_attempts = sync_attempts + 1, \
                last_attempt_at = ?, \
                last_error = ?, \
                sync_state = 'failed' \
             WHERE id = ? AND sync_state = 'pending'",
        )
        .bind(now_millis())
        .bind(detail)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let row = sqlx::query("SELECT sync_attempts FROM fallback_records WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        let attempts = row.try_get::<i64, _>("sync_attempts").unwrap_or(0).max(0) as u32;

        let entry = SyncLogEntry {
            seq: 0,
            record_id: id.to_string(),
            kind: kind.to_string(),
            result: SyncResult::Failed,
            timestamp: now_millis(),
            error_detail: Some(format!("unreadable: {}", detail)),
            attempt: attempts,
            pass_id: pass_id.to_string(),
        };
        Self::insert_log_entry(&mut tx, &entry).await?;
        tx.commit().await?;

        Ok(Some(FailureOutcome {
            state: SyncState::Failed,
            attempts,
        }))
    }

    /// Operator override: put a failed record back in the queue with a fresh
    /// retry budget. This is the only path that resets `sync_attempts`.
    pub async fn requeue(&self, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE fallback_records SET sync_state = 'pending', sync_attempts = 0, \
                last_attempt_at = NULL, last_error = NULL \
             WHERE id = ? AND sync_state = 'failed'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        let requeued = result.rows_affected() > 0;
        if requeued {
            warn!(id = %id, "Failed record requeued by operator, retry budget reset");
        }
        Ok(requeued)
    }

    /// Append an entry to the audit log. Returns its sequence number.
    pub async fn append_sync_log(&self, entry: &SyncLogEntry) -> Result<i64, StorageError> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_log_entry(&mut conn, entry).await
    }

    async fn insert_log_entry(
        conn: &mut sqlx::AnyConnection,
        entry: &SyncLogEntry,
    ) -> Result<i64, StorageError> {
        sqlx::query(
            "INSERT INTO sync_log (record_id, kind, result, timestamp, error_detail, attempt, pass_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.record_id)
        .bind(&entry.kind)
        .bind(entry.result.as_str())
        .bind(entry.timestamp)
        .bind(entry.error_detail.clone())
        .bind(i64::from(entry.attempt))
        .bind(&entry.pass_id)
        .execute(&mut *conn)
        .await?;

        let row = sqlx::query("SELECT last_insert_rowid() AS seq")
            .fetch_one(&mut *conn)
            .await?;
        Ok(row.try_get::<i64, _>("seq")?)
    }

    /// Read the audit log, oldest entry first.
    pub async fn sync_log(&self, filter: &AuditFilter) -> Result<Vec<SyncLogEntry>, StorageError> {
        let mut parts = Vec::new();
        if filter.record_id.is_some() {
            parts.push("record_id = ?");
        }
        if filter.result.is_some() {
            parts.push("result = ?");
        }
        if filter.since.is_some() {
            parts.push("timestamp >= ?");
        }
        let mut sql = String::from(
            "SELECT seq, record_id, kind, result, timestamp, error_detail, attempt, pass_id FROM sync_log",
        );
        if !parts.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&parts.join(" AND "));
        }
        sql.push_str(" ORDER BY seq ASC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(ref id) = filter.record_id {
            query = query.bind(id.as_str());
        }
        if let Some(result) = filter.result {
            query = query.bind(result.as_str());
        }
        if let Some(since) = filter.since {
            query = query.bind(since);
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let result_str = text_column(&row, "result").unwrap_or_default();
            let Some(result) = SyncResult::parse(&result_str) else {
                warn!(result = %result_str, "Skipping audit entry with unknown result");
                continue;
            };
            entries.push(SyncLogEntry {
                seq: row.try_get("seq")?,
                record_id: text_column(&row, "record_id").unwrap_or_default(),
                kind: text_column(&row, "kind").unwrap_or_default(),
                result,
                timestamp: row.try_get("timestamp")?,
                error_detail: text_column(&row, "error_detail"),
                attempt: row.try_get::<i64, _>("attempt").unwrap_or(0).max(0) as u32,
                pass_id: text_column(&row, "pass_id").unwrap_or_default(),
            });
        }
        Ok(entries)
    }

    /// Counts by sync state.
    pub async fn stats(&self) -> Result<FallbackStats, StorageError> {
        let rows = sqlx::query(
            "SELECT sync_state, COUNT(*) AS cnt FROM fallback_records GROUP BY sync_state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = FallbackStats {
            total_written: self.total_written.load(Ordering::Relaxed),
            ..FallbackStats::default()
        };
        for row in rows {
            let count = row.try_get::<i64, _>("cnt")?.max(0) as u64;
            match SyncState::parse(&text_column(&row, "sync_state").unwrap_or_default()) {
                SyncState::Pending => stats.pending += count,
                SyncState::Synced => stats.synced += count,
                SyncState::Failed => stats.failed += count,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl RecordStore for FallbackStore {
    fn name(&self) -> &str {
        "fallback"
    }

    /// Upsert tagged `pending`. A re-insert keeps `created_at` (queue
    /// position) and `sync_attempts`; the row goes back to `pending` unless
    /// the content and timestamp are unchanged.
    async fn insert(&self, record: &Record) -> Result<String, StorageError> {
        let content_hash = Record::compute_hash(&record.kind, &record.payload);
        sqlx::query(
            "INSERT INTO fallback_records \
                (id, kind, payload, content_hash, created_at, updated_at, sync_state, sync_attempts) \
             VALUES (?, ?, ?, ?, ?, ?, 'pending', 0) \
             ON CONFLICT(id) DO UPDATE SET \
                sync_state = CASE \
                    WHEN fallback_records.content_hash = excluded.content_hash \
                     AND fallback_records.updated_at = excluded.updated_at \
                    THEN fallback_records.sync_state ELSE 'pending' END, \
                kind = excluded.kind, \
                payload = excluded.payload, \
                content_hash = excluded.content_hash, \
                updated_at = excluded.updated_at",
        )
        .bind(&record.id)
        .bind(&record.kind)
        .bind(record.payload.to_string())
        .bind(&content_hash)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        let written = self.total_written.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(id = %record.id, kind = %record.kind, written, "Record written to fallback store");
        Ok(record.id.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<Record>, StorageError> {
        let sql = format!("SELECT {} FROM fallback_records WHERE id = ?", RECORD_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<Record>, StorageError> {
        let where_sql = filter.to_sql_with_state();
        let mut sql = format!(
            "SELECT {} FROM fallback_records{} ORDER BY created_at ASC, id ASC",
            RECORD_COLUMNS,
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
        rows.iter().map(Self::parse_row).collect()
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64, StorageError> {
        let where_sql = filter.to_sql_with_state();
        let sql = format!("SELECT COUNT(*) AS cnt FROM fallback_records{}", where_sql.where_sql());
        let row = where_sql.bind(sqlx::query(&sql)).fetch_one(&self.pool).await?;
        let count: i64 = row.try_get("cnt")?;
        Ok(count as u64)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn set_sync_state(&self, id: &str, state: SyncState) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE fallback_records SET sync_state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn test_record(id: &str, kind: &str, created_at: i64) -> Record {
        Record::with_id(id, kind, json!({"test": "data", "id": id})).at(created_at, created_at)
    }

    async fn open(dir: &tempfile::TempDir) -> FallbackStore {
        FallbackStore::open(dir.path().join("fallback.db")).await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_tags_pending() {
        let dir = tempdir().unwrap();
        let store = open(&dir).await;

        store.insert(&test_record("a", "event", 1)).await.unwrap();

        let loaded = store.get("a").await.unwrap().unwrap();
        assert_eq!(loaded.sync_state, SyncState::Pending);
        assert_eq!(loaded.sync_attempts, 0);
        assert_eq!(store.count_pending(None).await.unwrap(), 1);
        assert_eq!(store.stats().await.unwrap().total_written, 1);
    }

    #[tokio::test]
    async fn test_persistence_across_restart() {
        let dir = tempdir().unwrap();

        {
            let store = open(&dir).await;
            store.insert(&test_record("persist-1", "event", 1)).await.unwrap();
            store.insert(&test_record("persist-2", "event", 2)).await.unwrap();
            store.insert(&test_record("persist-3", "session", 3)).await.unwrap();
        }

        let store = open(&dir).await;
        assert_eq!(store.count_pending(None).await.unwrap(), 3);
        assert_eq!(store.get("persist-2").await.unwrap().unwrap().payload["id"], "persist-2");
    }

    #[tokio::test]
    async fn test_get_pending_is_fifo_per_kind() {
        let dir = tempdir().unwrap();
        let store = open(&dir).await;

        // Inserted out of order
        store.insert(&test_record("c", "event", 30)).await.unwrap();
        store.insert(&test_record("x", "session", 5)).await.unwrap();
        store.insert(&test_record("a", "event", 10)).await.unwrap();
        store.insert(&test_record("b", "event", 20)).await.unwrap();

        let pending = store.get_pending("event", 10).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let limited = store.get_pending("event", 2).await.unwrap();
        assert_eq!(limited.len(), 2);

        assert_eq!(store.pending_kinds().await.unwrap(), vec!["event", "session"]);
    }

    #[tokio::test]
    async fn test_equal_created_at_falls_back_to_insertion_order() {
        let dir = tempdir().unwrap();
        let store = open(&dir).await;

        store.insert(&test_record("second", "event", 7)).await.unwrap();
        store.insert(&test_record("first", "event", 7)).await.unwrap();

        let ids: Vec<String> = store
            .get_pending("event", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn test_reinsert_updates_without_duplicating() {
        let dir = tempdir().unwrap();
        let store = open(&dir).await;

        let mut record = test_record("r", "event", 1);
        store.insert(&record).await.unwrap();
        store.mark_synced("r").await.unwrap();

        record.update_payload(json!({"v": 2}));
        store.insert(&record).await.unwrap();

        assert_eq!(store.count(&RecordFilter::all()).await.unwrap(), 1);
        let loaded = store.get("r").await.unwrap().unwrap();
        assert_eq!(loaded.payload["v"], 2);
        assert_eq!(loaded.created_at, 1);
        // New content must be replayed again
        assert_eq!(loaded.sync_state, SyncState::Pending);
    }

    #[tokio::test]
    async fn test_identical_reinsert_keeps_state() {
        let dir = tempdir().unwrap();
        let store = open(&dir).await;

        let record = test_record("r", "event", 1);
        store.insert(&record).await.unwrap();
        store.mark_synced("r").await.unwrap();
        store.insert(&record).await.unwrap();

        assert_eq!(store.get("r").await.unwrap().unwrap().sync_state, SyncState::Synced);
    }

    #[tokio::test]
    async fn test_mark_synced_and_failed() {
        let dir = tempdir().unwrap();
        let store = open(&dir).await;

        store.insert(&test_record("ok", "event", 1)).await.unwrap();
        store.insert(&test_record("bad", "event", 2)).await.unwrap();

        assert!(store.mark_synced("ok").await.unwrap());
        assert!(store.mark_failed("bad", "poison").await.unwrap());
        assert!(!store.mark_synced("missing").await.unwrap());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.synced, 1);
        assert_eq!(stats.failed, 1);
        assert!(store.get_pending("event", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_sync_rewrites_row_and_logs() {
        let dir = tempdir().unwrap();
        let store = open(&dir).await;

        let replayed = test_record("r", "event", 1);
        store.insert(&replayed).await.unwrap();

        let mut resolved = replayed.clone();
        resolved.update_payload(json!({"merged": true}));

        assert!(store.complete_sync(&replayed, &resolved, "pass-1").await.unwrap());

        let loaded = store.get("r").await.unwrap().unwrap();
        assert_eq!(loaded.sync_state, SyncState::Synced);
        assert_eq!(loaded.payload, json!({"merged": true}));

        let log = store.sync_log(&AuditFilter::for_record("r")).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].result, SyncResult::Success);
        assert_eq!(log[0].pass_id, "pass-1");
        assert!(log[0].seq > 0);
    }

    #[tokio::test]
    async fn test_complete_sync_skips_row_changed_meanwhile() {
        let dir = tempdir().unwrap();
        let store = open(&dir).await;

        let replayed = test_record("r", "event", 1);
        store.insert(&replayed).await.unwrap();

        // Producer writes a newer version while the replay is in flight
        let mut newer = replayed.clone();
        newer.update_payload(json!({"v": "newer"}));
        store.insert(&newer).await.unwrap();

        assert!(!store.complete_sync(&replayed, &replayed, "pass-1").await.unwrap());

        let loaded = store.get("r").await.unwrap().unwrap();
        assert_eq!(loaded.sync_state, SyncState::Pending);
        assert_eq!(loaded.payload["v"], "newer");
        assert!(store.sync_log(&AuditFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_reaches_failed_exactly_at_max_attempts() {
        let dir = tempdir().unwrap();
        let store = open(&dir).await;

        let record = test_record("poison", "event", 1);
        store.insert(&record).await.unwrap();

        for attempt in 1..=4 {
            let outcome = store
                .record_sync_failure(&record, "boom", 5, "p")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(outcome.attempts, attempt);
            assert_eq!(outcome.state, SyncState::Pending, "attempt {} must stay pending", attempt);
        }

        let outcome = store.record_sync_failure(&record, "boom", 5, "p").await.unwrap().unwrap();
        assert_eq!(outcome.attempts, 5);
        assert_eq!(outcome.state, SyncState::Failed);

        // Failed rows are out of the queue
        assert!(store.record_sync_failure(&record, "boom", 5, "p").await.unwrap().is_none());
        assert_eq!(store.count_pending(None).await.unwrap(), 0);

        let loaded = store.get("poison").await.unwrap().unwrap();
        assert_eq!(loaded.sync_attempts, 5);
        assert!(loaded.last_attempt_at.is_some());

        let failures = store
            .sync_log(&AuditFilter::for_record("poison").result(SyncResult::Failed))
            .await
            .unwrap();
        assert_eq!(failures.len(), 5);
        let attempts: Vec<u32> = failures.iter().map(|e| e.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_requeue_resets_budget() {
        let dir = tempdir().unwrap();
        let store = open(&dir).await;

        let record = test_record("r", "event", 1);
        store.insert(&record).await.unwrap();
        store.record_sync_failure(&record, "boom", 1, "p").await.unwrap();
        assert_eq!(store.get("r").await.unwrap().unwrap().sync_state, SyncState::Failed);

        assert!(store.requeue("r").await.unwrap());
        let loaded = store.get("r").await.unwrap().unwrap();
        assert_eq!(loaded.sync_state, SyncState::Pending);
        assert_eq!(loaded.sync_attempts, 0);
        assert!(loaded.last_attempt_at.is_none());

        // Only failed rows can be requeued
        assert!(!store.requeue("r").await.unwrap());
    }

    #[tokio::test]
    async fn test_query_with_state_filter() {
        let dir = tempdir().unwrap();
        let store = open(&dir).await;

        store.insert(&test_record("a", "event", 1)).await.unwrap();
        store.insert(&test_record("b", "event", 2)).await.unwrap();
        store.mark_synced("a").await.unwrap();

        let pending = store
            .query(&RecordFilter::kind("event").sync_state(SyncState::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "b");
        assert_eq!(store.count(&RecordFilter::kind("event")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sync_log_filters() {
        let dir = tempdir().unwrap();
        let store = open(&dir).await;

        let a = test_record("a", "event", 1);
        let b = test_record("b", "event", 2);
        store.append_sync_log(&SyncLogEntry::new(&a, SyncResult::Success, "p1")).await.unwrap();
        store
            .append_sync_log(&SyncLogEntry::new(&b, SyncResult::Partial, "p1").with_error("raced"))
            .await
            .unwrap();
        store.append_sync_log(&SyncLogEntry::new(&a, SyncResult::Failed, "p2")).await.unwrap();

        let all = store.sync_log(&AuditFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));

        let for_a = store.sync_log(&AuditFilter::for_record("a")).await.unwrap();
        assert_eq!(for_a.len(), 2);

        let partial = store
            .sync_log(&AuditFilter::default().result(SyncResult::Partial))
            .await
            .unwrap();
        assert_eq!(partial.len(), 1);
        assert_eq!(partial[0].error_detail.as_deref(), Some("raced"));

        let limited = store.sync_log(&AuditFilter::default().limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_file_size_and_checkpoint() {
        let dir = tempdir().unwrap();
        let store = open(&dir).await;

        store.insert(&test_record("size", "event", 1)).await.unwrap();
        assert!(store.file_size_bytes().unwrap() > 0);
        store.checkpoint().await.unwrap();
    }

    #[tokio::test]
    async fn test_float_payload_reads_back_intact() {
        let dir = tempdir().unwrap();
        let store = open(&dir).await;

        let record = Record::with_id("r", "event", json!({"x": 0.015342375198784997}));
        store.insert(&record).await.unwrap();

        let loaded = store.get("r").await.unwrap().unwrap();
        assert_eq!(loaded.payload, record.payload);
        assert_eq!(loaded.content_hash, record.content_hash);
        assert_eq!(store.get_pending("event", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_hashes_payload_not_caller_field() {
        let dir = tempdir().unwrap();
        let store = open(&dir).await;

        let mut record = Record::with_id("s", "event", json!({"v": 1}));
        record.payload = json!({"v": 2});
        store.insert(&record).await.unwrap();

        let loaded = store.get("s").await.unwrap().unwrap();
        assert_eq!(loaded.content_hash, Record::compute_hash("event", &json!({"v": 2})));
        assert_eq!(store.query(&RecordFilter::all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_row_is_returned_in_place_and_failed() {
        let dir = tempdir().unwrap();
        let store = open(&dir).await;

        store.insert(&test_record("a", "event", 1)).await.unwrap();
        store.insert(&test_record("b", "event", 2)).await.unwrap();
        sqlx::query("UPDATE fallback_records SET payload = ? WHERE id = ?")
            .bind("{not json")
            .bind("a")
            .execute(&store.pool)
            .await
            .unwrap();

        assert!(store.get_pending("event", 10).await.is_err());

        let rows = store.pending_rows("event", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(matches!(&rows[0], PendingRow::Unreadable { id, .. } if id == "a"));
        assert!(matches!(&rows[1], PendingRow::Ready(r) if r.id == "b"));

        let outcome = store.fail_unreadable("a", "event", "bad json", "pass-1").await.unwrap().unwrap();
        assert_eq!(outcome.state, SyncState::Failed);
        assert!(store.fail_unreadable("a", "event", "bad json", "pass-1").await.unwrap().is_none());

        assert_eq!(store.get_pending("event", 10).await.unwrap().len(), 1);
        let failed = store
            .sync_log(&AuditFilter::default().result(SyncResult::Failed))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].record_id, "a");
    }
}
