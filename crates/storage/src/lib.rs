use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, Transaction,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    change::ChangeEvent,
    domain::{Record, RecordId, StorageHandle},
};

/// Longest title the schema accepts; longer writes are rejected by the
/// database and roll back the surrounding transaction.
pub const MAX_TITLE_LEN: usize = 4096;

const TEMPORARY_ID_SEQUENCE: &str = "temporary_record_id";

const RECORD_COLUMNS: &str = "handle, id, title, completed, soft_deleted";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Opens a write transaction. Every mutation of `records` goes through one.
    pub async fn begin(&self) -> Result<WriteTransaction> {
        let tx = self
            .pool
            .begin()
            .await
            .context("failed to open write transaction")?;
        Ok(WriteTransaction {
            tx,
            change: ChangeEvent::default(),
        })
    }

    /// All records not soft-deleted, ordered by id magnitude then handle.
    pub async fn list_live_records(&self) -> Result<Vec<Record>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE soft_deleted = 0 ORDER BY abs(id), handle"
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to list records")?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn record(&self, handle: StorageHandle) -> Result<Option<Record>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE handle = ?"
        ))
        .bind(handle.0)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load record handle={handle}"))?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Hard-removes rows left behind by soft deletes.
    pub async fn purge_soft_deleted(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM records WHERE soft_deleted = 1")
            .execute(&self.pool)
            .await
            .context("failed to purge soft-deleted records")?;
        Ok(result.rows_affected())
    }
}

/// An open batch of record writes. Dropping it without `commit` rolls back.
pub struct WriteTransaction {
    tx: Transaction<'static, Sqlite>,
    change: ChangeEvent,
}

impl WriteTransaction {
    /// Inserts `record` and returns its durable handle, assigned before commit.
    pub async fn insert_record(&mut self, record: &Record) -> Result<StorageHandle> {
        let handle: i64 = sqlx::query_scalar(
            "INSERT INTO records (id, title, completed, soft_deleted) VALUES (?, ?, ?, ?)
             RETURNING handle",
        )
        .bind(record.id.0)
        .bind(record.title.as_deref())
        .bind(record.completed)
        .bind(record.soft_deleted)
        .fetch_one(&mut *self.tx)
        .await
        .with_context(|| format!("failed to insert record id={}", record.id))?;

        let handle = StorageHandle(handle);
        self.change.inserted.insert(handle);
        Ok(handle)
    }

    /// Writes the fields of `record` into row `handle`. Returns false when
    /// the row is missing or already holds exactly these values.
    pub async fn update_record(&mut self, handle: StorageHandle, record: &Record) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE records SET id = ?1, title = ?2, completed = ?3, soft_deleted = ?4
             WHERE handle = ?5
               AND (id IS NOT ?1 OR title IS NOT ?2 OR completed IS NOT ?3 OR soft_deleted IS NOT ?4)",
        )
        .bind(record.id.0)
        .bind(record.title.as_deref())
        .bind(record.completed)
        .bind(record.soft_deleted)
        .bind(handle.0)
        .execute(&mut *self.tx)
        .await
        .with_context(|| format!("failed to update record handle={handle}"))?;

        let changed = result.rows_affected() > 0;
        if changed && !self.change.inserted.contains(&handle) {
            self.change.updated.insert(handle);
        }
        Ok(changed)
    }

    pub async fn delete_record(&mut self, handle: StorageHandle) -> Result<bool> {
        let result = sqlx::query("DELETE FROM records WHERE handle = ?")
            .bind(handle.0)
            .execute(&mut *self.tx)
            .await
            .with_context(|| format!("failed to delete record handle={handle}"))?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            self.record_removal(handle);
        }
        Ok(deleted)
    }

    /// Hides row `handle` from every live read while keeping it on disk
    /// until `purge_soft_deleted`. Reported as a deletion.
    pub async fn soft_delete_record(&mut self, handle: StorageHandle) -> Result<bool> {
        let result =
            sqlx::query("UPDATE records SET soft_deleted = 1 WHERE handle = ? AND soft_deleted = 0")
                .bind(handle.0)
                .execute(&mut *self.tx)
                .await
                .with_context(|| format!("failed to soft-delete record handle={handle}"))?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            self.record_removal(handle);
        }
        Ok(deleted)
    }

    fn record_removal(&mut self, handle: StorageHandle) {
        self.change.updated.remove(&handle);
        if !self.change.inserted.remove(&handle) {
            self.change.deleted.insert(handle);
        }
    }

    /// Finds the live record currently carrying `id`.
    pub async fn find_by_id(&mut self, id: RecordId) -> Result<Option<Record>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE id = ? AND soft_deleted = 0
             ORDER BY handle LIMIT 1"
        ))
        .bind(id.0)
        .fetch_optional(&mut *self.tx)
        .await
        .with_context(|| format!("failed to look up record id={id}"))?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn list_live(&mut self) -> Result<Vec<Record>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE soft_deleted = 0 ORDER BY abs(id), handle"
        ))
        .fetch_all(&mut *self.tx)
        .await
        .context("failed to list records in transaction")?;
        rows.iter().map(record_from_row).collect()
    }

    /// Allocates the next temporary id. The sequence is persisted and only
    /// ever decreases, so a temporary id is never handed out twice.
    pub async fn next_temporary_id(&mut self) -> Result<RecordId> {
        let value: i64 = sqlx::query_scalar(
            "INSERT INTO id_sequences (name, value) VALUES (?1, -1)
             ON CONFLICT(name) DO UPDATE SET value = value - 1
             RETURNING value",
        )
        .bind(TEMPORARY_ID_SEQUENCE)
        .fetch_one(&mut *self.tx)
        .await
        .context("failed to allocate temporary record id")?;
        Ok(RecordId(value))
    }

    /// Commits the batch and hands back what it changed.
    pub async fn commit(self) -> Result<ChangeEvent> {
        self.tx
            .commit()
            .await
            .context("failed to commit write transaction")?;
        Ok(self.change)
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx
            .rollback()
            .await
            .context("failed to roll back write transaction")?;
        Ok(())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<Record> {
    Ok(Record {
        id: RecordId(row.try_get("id")?),
        title: row.try_get("title")?,
        completed: row.try_get("completed")?,
        soft_deleted: row.try_get("soft_deleted")?,
        storage_handle: Some(StorageHandle(row.try_get("handle")?)),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
