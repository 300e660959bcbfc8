//! Durable key-value store.
//!
//! All engine state lives in one sqlite table of filesystem-like keys and
//! self-describing JSON values. Multi-key writes (job state flips, hourly
//! bucket merges, supervisor checkpoints) run inside a single
//! transaction; scans iterate a key range in sorted order under the
//! transaction's snapshot.

use std::path::Path;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::error::EngineError;

pub mod keys;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS kv (\
     key TEXT PRIMARY KEY, value TEXT NOT NULL) WITHOUT ROWID";

// Keys are ASCII paths, so any prefix plus the maximum code point bounds
// the scanned range from above.
fn prefix_upper_bound(prefix: &str) -> String {
    format!("{prefix}\u{10FFFF}")
}

/// Handle to the engine's sqlite-backed key-value store.
///
/// Cloning is cheap; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) a store at `path`.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] if sqlite cannot open the file
    /// or create the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        Self::with_pool(pool).await
    }

    /// Open a fresh in-memory store; state is lost on drop.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] if sqlite cannot create the schema.
    pub async fn open_in_memory() -> Result<Self, EngineError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(EngineError::Store)?
            .journal_mode(SqliteJournalMode::Memory);
        // A single connection so that every handle observes one database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, EngineError> {
        sqlx::query(CREATE_TABLE).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Fetch and decode the value at `key`.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] on a database failure and
    /// [`EngineError::Codec`] if the stored value does not decode as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, EngineError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("value")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    /// Encode and store `value` at `key`, replacing any existing value.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] on a database failure.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), EngineError> {
        let raw = serde_json::to_string(value)?;
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(raw)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete the value at `key`; returns whether a value existed.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] on a database failure.
    pub async fn delete(&self, key: &str) -> Result<bool, EngineError> {
        let result = sqlx::query("DELETE FROM kv WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// All `(key, value)` entries whose key starts with `prefix`, in
    /// ascending key order.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] on a database failure.
    pub async fn scan_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, EngineError> {
        let rows = sqlx::query("SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key")
            .bind(prefix)
            .bind(prefix_upper_bound(prefix))
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key")?;
            let raw: String = row.try_get("value")?;
            entries.push((key, serde_json::from_str(&raw)?));
        }

        Ok(entries)
    }

    /// The largest key with the given prefix, if any.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] on a database failure.
    pub async fn last_key(&self, prefix: &str) -> Result<Option<String>, EngineError> {
        let row = sqlx::query(
            "SELECT key FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key DESC LIMIT 1",
        )
        .bind(prefix)
        .bind(prefix_upper_bound(prefix))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("key")?)),
            None => Ok(None),
        }
    }

    /// Begin a transaction. Dropping the returned [`StoreTx`] without
    /// calling [`StoreTx::commit`] rolls it back.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] if a transaction cannot start.
    pub async fn begin(&self) -> Result<StoreTx, EngineError> {
        Ok(StoreTx {
            tx: self.pool.begin().await?,
        })
    }
}

/// An open store transaction.
#[derive(Debug)]
pub struct StoreTx {
    tx: sqlx::Transaction<'static, sqlx::Sqlite>,
}

impl StoreTx {
    /// Fetch and decode the value at `key` under this transaction.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] on a database failure and
    /// [`EngineError::Codec`] if the stored value does not decode as `T`.
    pub async fn get<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, EngineError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("value")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    /// Encode and store `value` at `key` under this transaction.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] on a database failure.
    pub async fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), EngineError> {
        let raw = serde_json::to_string(value)?;
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(raw)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    /// Delete the value at `key` under this transaction.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] on a database failure.
    pub async fn delete(&mut self, key: &str) -> Result<bool, EngineError> {
        let result = sqlx::query("DELETE FROM kv WHERE key = ?1")
            .bind(key)
            .execute(&mut *self.tx)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Sorted prefix scan under this transaction's snapshot.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] on a database failure.
    pub async fn scan_prefix(
        &mut self,
        prefix: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, EngineError> {
        let rows = sqlx::query("SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key")
            .bind(prefix)
            .bind(prefix_upper_bound(prefix))
            .fetch_all(&mut *self.tx)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key")?;
            let raw: String = row.try_get("value")?;
            entries.push((key, serde_json::from_str(&raw)?));
        }

        Ok(entries)
    }

    /// Commit the transaction.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Store`] if the commit fails; the
    /// transaction is rolled back.
    pub async fn commit(self) -> Result<(), EngineError> {
        self.tx.commit().await?;

        Ok(())
    }
}
