//! Backup index data access
//!
//! [`BackupDao`] is the narrow contract the orchestrator needs from the
//! relational index: backup rows, the running heartbeat, dedup candidate
//! lookup and the final commit transaction. [`SqliteBackupDao`] is the
//! shipped implementation; tests substitute an in-memory one.

use crate::error::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Indexing and transfer duration of one previous full backup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullDuration {
    /// Milliseconds the agent spent building its file list
    pub indexing_ms: i64,
    /// Seconds the transfer phase took
    pub duration_s: i64,
}

/// Average previous durations into a single estimate
///
/// Used only to seed the initial ETA; an empty history yields zeros.
#[must_use]
pub fn interpolate_durations(durations: &[FullDuration]) -> FullDuration {
    if durations.is_empty() {
        return FullDuration {
            indexing_ms: 0,
            duration_s: 0,
        };
    }
    let n = durations.len() as i64;
    FullDuration {
        indexing_ms: durations.iter().map(|d| d.indexing_ms).sum::<i64>() / n,
        duration_s: durations.iter().map(|d| d.duration_s).sum::<i64>() / n,
    }
}

/// Operations the orchestrator performs on the backup index
#[async_trait]
pub trait BackupDao: Send + Sync {
    /// Indexing/transfer durations of the most recent completed full backups
    async fn last_full_durations(&self, client_id: i64) -> Result<Vec<FullDuration>>;

    /// Insert a new backup row, returning its id
    async fn new_file_backup(
        &self,
        incremental: i32,
        client_id: i64,
        path: &str,
        tgroup: i32,
        indexing_ms: i64,
        group: i32,
    ) -> Result<i64>;

    /// Refresh the running heartbeat timestamp
    async fn update_file_backup_running(&self, backup_id: i64) -> Result<()>;

    /// Mark the backup row done
    async fn set_file_backup_done(&self, backup_id: i64) -> Result<()>;

    /// Candidate source paths for a `(hash, size)` pair, most recent first
    async fn link_candidates(&self, hash: &[u8], size: i64) -> Result<Vec<PathBuf>>;

    /// Make a stored file discoverable for future dedup
    async fn register_linked(&self, hash: &[u8], size: i64, path: &Path) -> Result<()>;

    /// Seal the backup: rename the new file list into place and mark the row
    /// done inside one transaction
    async fn commit_backup(&self, backup_id: i64, list_new: &Path, list_final: &Path)
        -> Result<()>;
}

fn unix_now_s() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// SQLite-backed backup index
pub struct SqliteBackupDao {
    pool: SqlitePool,
}

impl SqliteBackupDao {
    /// Open (and if needed create) the index database
    ///
    /// # Errors
    ///
    /// Returns a database error if the pool cannot be opened or the schema
    /// cannot be created.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await?;
        let dao = Self { pool };
        dao.init_schema().await?;
        Ok(dao)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                incremental INTEGER NOT NULL,
                clientid INTEGER NOT NULL,
                path TEXT NOT NULL,
                tgroup INTEGER NOT NULL,
                indexing_time_ms INTEGER NOT NULL,
                backup_group INTEGER NOT NULL,
                starttime INTEGER NOT NULL,
                finishtime INTEGER,
                running INTEGER NOT NULL,
                done INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fullpath TEXT NOT NULL,
                shahash BLOB NOT NULL,
                filesize INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS files_hash_size ON files (shahash, filesize)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BackupDao for SqliteBackupDao {
    async fn last_full_durations(&self, client_id: i64) -> Result<Vec<FullDuration>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT indexing_time_ms, COALESCE(finishtime - starttime, 0)
             FROM backups
             WHERE clientid = ? AND incremental = 0 AND done = 1
             ORDER BY id DESC LIMIT 10",
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(indexing_ms, duration_s)| FullDuration {
                indexing_ms,
                duration_s,
            })
            .collect())
    }

    async fn new_file_backup(
        &self,
        incremental: i32,
        client_id: i64,
        path: &str,
        tgroup: i32,
        indexing_ms: i64,
        group: i32,
    ) -> Result<i64> {
        let now = unix_now_s();
        let res = sqlx::query(
            "INSERT INTO backups
             (incremental, clientid, path, tgroup, indexing_time_ms, backup_group,
              starttime, running, done)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(incremental)
        .bind(client_id)
        .bind(path)
        .bind(tgroup)
        .bind(indexing_ms)
        .bind(group)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    async fn update_file_backup_running(&self, backup_id: i64) -> Result<()> {
        sqlx::query("UPDATE backups SET running = ? WHERE id = ?")
            .bind(unix_now_s())
            .bind(backup_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_file_backup_done(&self, backup_id: i64) -> Result<()> {
        sqlx::query("UPDATE backups SET done = 1, finishtime = ? WHERE id = ?")
            .bind(unix_now_s())
            .bind(backup_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn link_candidates(&self, hash: &[u8], size: i64) -> Result<Vec<PathBuf>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT fullpath FROM files
             WHERE shahash = ? AND filesize = ?
             ORDER BY id DESC LIMIT 10",
        )
        .bind(hash)
        .bind(size)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(p,)| PathBuf::from(p)).collect())
    }

    async fn register_linked(&self, hash: &[u8], size: i64, path: &Path) -> Result<()> {
        sqlx::query("INSERT INTO files (fullpath, shahash, filesize) VALUES (?, ?, ?)")
            .bind(path.to_string_lossy().into_owned())
            .bind(hash)
            .bind(size)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn commit_backup(
        &self,
        backup_id: i64,
        list_new: &Path,
        list_final: &Path,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        // Rename failure is logged but does not abort sealing the row, so a
        // missing list does not strand the backup as permanently "running".
        if let Err(e) = std::fs::rename(list_new, list_final) {
            warn!(
                "Renaming new client file list to destination failed: {} -> {}: {e}",
                list_new.display(),
                list_final.display()
            );
        }
        sqlx::query("UPDATE backups SET done = 1, finishtime = ? WHERE id = ?")
            .bind(unix_now_s())
            .bind(backup_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
