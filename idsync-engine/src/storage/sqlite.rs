//! SQLite storage backend.

use crate::error::{StoreError, StoreResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::Sqlite;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// File-backed bucket/key store.
///
/// Uses WAL mode so readers see a consistent snapshot while a writer is
/// active. Writers are serialized by an in-process lock held for the
/// lifetime of the writable transaction.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
    path: PathBuf,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open the store at `path`, creating the file if it doesn't exist.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if path.as_os_str().is_empty() || path.is_dir() {
            return Err(StoreError::InvalidPath {
                path: path.to_path_buf(),
            });
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            writer: Arc::new(Mutex::new(())),
            path: path.to_path_buf(),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS buckets (
                name TEXT PRIMARY KEY
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                bucket TEXT NOT NULL,
                key BLOB NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            ) WITHOUT ROWID
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Begin a transaction.
    ///
    /// A writable transaction waits until any other writable transaction has
    /// closed. Read-only transactions never wait on the writer.
    pub async fn begin_tx(&self, writable: bool) -> StoreResult<Transaction> {
        let writer = if writable {
            Some(self.writer.clone().lock_owned().await)
        } else {
            None
        };
        let inner = self.pool.begin().await?;
        Ok(Transaction {
            inner: Some(inner),
            writable,
            _writer: writer,
        })
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` succeeds. Rolls back when it fails or panics; a
    /// failed rollback is logged and the original error (or panic) wins.
    pub async fn run_transaction<T, E, F>(&self, writable: bool, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, Result<T, E>>,
        E: From<StoreError>,
    {
        let mut tx = self.begin_tx(writable).await?;
        let outcome = AssertUnwindSafe(f(&mut tx)).catch_unwind().await;
        match outcome {
            Ok(Ok(value)) => {
                tx.commit().await?;
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(rb) = tx.rollback().await {
                    tracing::error!(error = %rb, "Failed to roll back transaction");
                }
                Err(err)
            }
            Err(panic) => {
                if let Err(rb) = tx.rollback().await {
                    tracing::error!(error = %rb, "Failed to roll back transaction after panic");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// An open store transaction.
///
/// Dropping an open transaction rolls it back. `commit` and `rollback` on a
/// closed transaction are no-ops, so cleanup may run on every exit path.
pub struct Transaction {
    inner: Option<sqlx::Transaction<'static, Sqlite>>,
    writable: bool,
    _writer: Option<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("writable", &self.writable)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Transaction {
    /// True for writable transactions.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// True once committed or rolled back.
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    fn conn(&mut self) -> StoreResult<&mut SqliteConnection> {
        self.inner.as_deref_mut().ok_or(StoreError::Closed)
    }

    fn writable_conn(&mut self) -> StoreResult<&mut SqliteConnection> {
        if !self.writable {
            return Err(StoreError::ReadOnly);
        }
        self.conn()
    }

    async fn bucket_exists(&mut self, bucket: &str) -> StoreResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM buckets WHERE name = ?1")
            .bind(bucket)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(found.is_some())
    }

    /// Raw value stored under `bucket`/`key`.
    ///
    /// Fails with [`StoreError::BucketNotFound`] or [`StoreError::KeyNotFound`]
    /// when there is no value.
    pub async fn get_bytes(&mut self, bucket: &str, key: &[u8]) -> StoreResult<Vec<u8>> {
        let value: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT value FROM entries WHERE bucket = ?1 AND key = ?2")
                .bind(bucket)
                .bind(key)
                .fetch_optional(self.conn()?)
                .await?;

        match value {
            Some(v) => Ok(v),
            None if self.bucket_exists(bucket).await? => Err(StoreError::KeyNotFound {
                bucket: bucket.to_string(),
            }),
            None => Err(StoreError::BucketNotFound {
                bucket: bucket.to_string(),
            }),
        }
    }

    /// Store a raw value, creating the bucket if needed.
    pub async fn set_bytes(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let conn = self.writable_conn()?;
        sqlx::query("INSERT OR IGNORE INTO buckets (name) VALUES (?1)")
            .bind(bucket)
            .execute(&mut *conn)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO entries (bucket, key, value)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(bucket, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(bucket)
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// JSON-decoded value stored under `bucket`/`key`.
    pub async fn get<T: DeserializeOwned>(&mut self, bucket: &str, key: &[u8]) -> StoreResult<T> {
        let bytes = self.get_bytes(bucket, key).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Store a value as JSON.
    pub async fn set<T: Serialize + ?Sized>(
        &mut self,
        bucket: &str,
        key: &[u8],
        value: &T,
    ) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set_bytes(bucket, key, &bytes).await
    }

    /// Delete a key. Deleting an absent key is a no-op.
    pub async fn delete(&mut self, bucket: &str, key: &[u8]) -> StoreResult<()> {
        sqlx::query("DELETE FROM entries WHERE bucket = ?1 AND key = ?2")
            .bind(bucket)
            .bind(key)
            .execute(self.writable_conn()?)
            .await?;
        Ok(())
    }

    /// Visit every entry of `bucket` in key order.
    ///
    /// An error from `f` stops the iteration and is returned.
    pub async fn for_each<E, F>(&mut self, bucket: &str, mut f: F) -> Result<(), E>
    where
        F: FnMut(&[u8], &[u8]) -> Result<(), E>,
        E: From<StoreError>,
    {
        if !self.bucket_exists(bucket).await? {
            return Err(StoreError::BucketNotFound {
                bucket: bucket.to_string(),
            }
            .into());
        }
        let rows: Vec<(Vec<u8>, Vec<u8>)> =
            sqlx::query_as("SELECT key, value FROM entries WHERE bucket = ?1 ORDER BY key")
                .bind(bucket)
                .fetch_all(self.conn().map_err(E::from)?)
                .await
                .map_err(|e| E::from(StoreError::from(e)))?;

        for (key, value) in &rows {
            f(key, value)?;
        }
        Ok(())
    }

    /// Commit the transaction.
    ///
    /// On a read-only transaction this is a rollback. No-op if already closed.
    pub async fn commit(&mut self) -> StoreResult<()> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };
        let result = if self.writable {
            inner.commit().await
        } else {
            inner.rollback().await
        };
        self._writer = None;
        result.map_err(StoreError::from)
    }

    /// Roll back the transaction. No-op if already closed.
    pub async fn rollback(&mut self) -> StoreResult<()> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };
        let result = inner.rollback().await;
        self._writer = None;
        result.map_err(StoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("state.db")).await.unwrap();
        (dir, store)
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
    }

    #[tokio::test]
    async fn json_values_roundtrip() {
        let (_dir, store) = test_store().await;
        let mut tx = store.begin_tx(true).await.unwrap();
        let record = Record { name: "A".into() };
        tx.set("users", b"u1", &record).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin_tx(false).await.unwrap();
        let got: Record = tx.get("users", b"u1").await.unwrap();
        assert_eq!(got, record);
        assert_eq!(tx.get_bytes("users", b"u1").await.unwrap(), br#"{"name":"A"}"#);
    }

    #[tokio::test]
    async fn missing_bucket_and_key_are_distinguished() {
        let (_dir, store) = test_store().await;
        let mut tx = store.begin_tx(true).await.unwrap();

        let err = tx.get_bytes("users", b"u1").await.unwrap_err();
        assert!(matches!(err, StoreError::BucketNotFound { .. }));
        assert!(err.is_not_found());

        tx.set_bytes("users", b"u2", b"x").await.unwrap();
        let err = tx.get_bytes("users", b"u1").await.unwrap_err();
        assert!(matches!(err, StoreError::KeyNotFound { .. }));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_absent_key_is_noop() {
        let (_dir, store) = test_store().await;
        let mut tx = store.begin_tx(true).await.unwrap();
        tx.delete("users", b"nobody").await.unwrap();
        tx.set_bytes("users", b"u1", b"x").await.unwrap();
        tx.delete("users", b"u1").await.unwrap();
        assert!(tx.get_bytes("users", b"u1").await.unwrap_err().is_not_found());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn for_each_is_ordered_and_aborts_on_error() {
        let (_dir, store) = test_store().await;
        let mut tx = store.begin_tx(true).await.unwrap();
        for key in [b"c", b"a", b"b"] {
            tx.set_bytes("users", key, key).await.unwrap();
        }

        let mut seen = Vec::new();
        tx.for_each::<StoreError, _>("users", |k, _| {
            seen.push(k.to_vec());
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        let mut visited = 0;
        let err = tx
            .for_each("users", |_, _| {
                visited += 1;
                Err(StoreError::Closed)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Closed));
        assert_eq!(visited, 1);

        let err = tx
            .for_each::<StoreError, _>("devices", |_, _| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BucketNotFound { .. }));
    }

    #[tokio::test]
    async fn failed_transaction_leaves_no_writes() {
        let (_dir, store) = test_store().await;
        store
            .run_transaction(true, |tx| {
                Box::pin(async move { tx.set_bytes("users", b"u1", b"before").await })
            })
            .await
            .unwrap();

        let result: Result<(), StoreError> = store
            .run_transaction(true, |tx| {
                Box::pin(async move {
                    tx.set_bytes("users", b"u1", b"after").await?;
                    tx.set_bytes("users", b"u2", b"new").await?;
                    Err::<(), StoreError>(StoreError::Closed)
                })
            })
            .await;
        assert!(result.is_err());

        let mut tx = store.begin_tx(false).await.unwrap();
        assert_eq!(tx.get_bytes("users", b"u1").await.unwrap(), b"before");
        assert!(tx.get_bytes("users", b"u2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn panicking_transaction_rolls_back() {
        let (_dir, store) = test_store().await;
        let result = AssertUnwindSafe(store.run_transaction::<(), StoreError, _>(true, |tx| {
            Box::pin(async move {
                tx.set_bytes("users", b"u1", b"x").await?;
                if tx.is_writable() {
                    panic!("boom");
                }
                Ok::<(), StoreError>(())
            })
        }))
        .catch_unwind()
        .await;
        assert!(result.is_err());

        // Writer lock was released and nothing was persisted.
        let mut tx = store.begin_tx(true).await.unwrap();
        assert!(tx.get_bytes("users", b"u1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn read_only_transactions_reject_writes() {
        let (_dir, store) = test_store().await;
        let mut tx = store.begin_tx(false).await.unwrap();
        assert!(matches!(
            tx.set_bytes("users", b"u1", b"x").await,
            Err(StoreError::ReadOnly)
        ));
        assert!(matches!(
            tx.delete("users", b"u1").await,
            Err(StoreError::ReadOnly)
        ));
        // Commit of a read-only transaction is a rollback.
        tx.commit().await.unwrap();
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn double_close_is_noop() {
        let (_dir, store) = test_store().await;
        let mut tx = store.begin_tx(true).await.unwrap();
        tx.set_bytes("users", b"u1", b"x").await.unwrap();
        tx.commit().await.unwrap();
        tx.commit().await.unwrap();
        tx.rollback().await.unwrap();
        assert!(matches!(
            tx.get_bytes("users", b"u1").await,
            Err(StoreError::Closed)
        ));

        let mut tx = store.begin_tx(false).await.unwrap();
        assert_eq!(tx.get_bytes("users", b"u1").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn second_writer_waits_for_first() {
        let (_dir, store) = test_store().await;
        let mut first = store.begin_tx(true).await.unwrap();
        first.set_bytes("users", b"u1", b"x").await.unwrap();

        let other = store.clone();
        let second = tokio::spawn(async move { other.begin_tx(true).await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!second.is_finished());

        first.commit().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .expect("second writer should proceed after commit")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn readers_run_alongside_writer() {
        let (_dir, store) = test_store().await;
        store
            .run_transaction(true, |tx| {
                Box::pin(async move { tx.set_bytes("users", b"u1", b"old").await })
            })
            .await
            .unwrap();

        let mut writer = store.begin_tx(true).await.unwrap();
        writer.set_bytes("users", b"u1", b"new").await.unwrap();

        let mut reader = tokio::time::timeout(Duration::from_secs(1), store.begin_tx(false))
            .await
            .expect("reader must not wait for the writer")
            .unwrap();
        assert_eq!(reader.get_bytes("users", b"u1").await.unwrap(), b"old");
        reader.rollback().await.unwrap();

        writer.commit().await.unwrap();
    }

    #[tokio::test]
    async fn committed_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = Store::open(&path).await.unwrap();
            let mut tx = store.begin_tx(true).await.unwrap();
            tx.set("state", b"last_sync", &"2026-01-01T00:00:00Z").await.unwrap();
            tx.commit().await.unwrap();
            store.close().await;
        }

        let store = Store::open(&path).await.unwrap();
        let mut tx = store.begin_tx(false).await.unwrap();
        let got: String = tx.get("state", b"last_sync").await.unwrap();
        assert_eq!(got, "2026-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn directory_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Store::open(dir.path()).await,
            Err(StoreError::InvalidPath { .. })
        ));
    }
}
