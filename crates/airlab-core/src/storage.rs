//! SQLite persistence for validated readings.
//!
//! One append-only table, one nullable column per canonical metric, a
//! server-assigned timestamp and an auto-increment id. Each reading is written
//! in a single transaction; lock contention is retried per [`RetryPolicy`].

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result, StorageError};
use crate::metric::CanonicalMetric;
use crate::reading::Reading;
use crate::retry::{RetryPolicy, is_retryable, with_retry_blocking};

/// Schema for the readings table. Idempotent.
pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS airlab_readings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
    co2_ppm REAL,
    temperature_c REAL,
    humidity_percent REAL,
    pressure_hpa REAL,
    voc_index REAL,
    nox_index REAL
);
CREATE INDEX IF NOT EXISTS idx_airlab_timestamp ON airlab_readings(timestamp);
";

const INSERT_SQL: &str = "INSERT INTO airlab_readings \
    (co2_ppm, temperature_c, humidity_percent, pressure_hpa, voc_index, nox_index) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

const SELECT_COLUMNS: &str = "id, timestamp, co2_ppm, temperature_c, humidity_percent, \
    pressure_hpa, voc_index, nox_index";

/// A persisted reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: i64,
    /// `YYYY-MM-DD HH:MM:SS` in UTC, assigned by SQLite.
    pub timestamp: String,
    pub reading: Reading,
}

/// Result of a durable write.
#[derive(Debug, Clone)]
pub struct WriteReceipt {
    pub record: StoredRecord,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Apply the schema to an open connection.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Open (creating if needed) the database file and apply the schema.
pub fn open_database(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    initialize_schema(&conn)?;
    debug!(db_path = %path.display(), "Database ready");
    Ok(conn)
}

/// Durable writer and reader for the readings table.
///
/// Cloning shares the underlying connection.
#[derive(Clone)]
pub struct ReadingStore {
    conn: Arc<Mutex<Connection>>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for ReadingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadingStore")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ReadingStore {
    /// Open a file-backed store with the schema applied.
    pub fn open(path: &Path, busy_timeout: Duration, policy: RetryPolicy) -> Result<Self> {
        let conn = open_database(path, busy_timeout)?;
        Ok(Self::from_connection(conn, policy))
    }

    /// Wrap an existing connection. The schema is not touched.
    #[must_use]
    pub fn from_connection(conn: Connection, policy: RetryPolicy) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            policy,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Runtime("storage connection mutex poisoned".to_string()))
    }

    /// Persist one reading as a single record, retrying on lock contention.
    ///
    /// Blocks the calling thread across retries. From async code use
    /// [`ReadingStore::insert_async`].
    pub fn insert(&self, reading: &Reading) -> Result<WriteReceipt> {
        if reading.is_empty() {
            return Err(Error::EmptyReading);
        }

        let outcome = with_retry_blocking(&self.policy, is_retryable, |attempt| {
            debug!(attempt, "Inserting reading");
            self.try_insert(reading)
        });
        let record = outcome.result?;

        info!(
            record_id = record.id,
            attempts = outcome.attempts,
            "Saved: {}",
            record.reading
        );
        Ok(WriteReceipt {
            record,
            attempts: outcome.attempts,
        })
    }

    /// [`ReadingStore::insert`] on the blocking thread pool.
    pub async fn insert_async(&self, reading: Reading) -> Result<WriteReceipt> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.insert(&reading))
            .await
            .map_err(|e| Error::Runtime(format!("Task join error: {e}")))?
    }

    /// One attempt: insert and commit atomically, or leave nothing behind.
    fn try_insert(&self, reading: &Reading) -> Result<StoredRecord> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;

        let values: Vec<Option<f64>> = CanonicalMetric::ALL
            .iter()
            .map(|metric| reading.get(*metric))
            .collect();
        tx.execute(INSERT_SQL, params_from_iter(values.iter()))
            .map_err(StorageError::from)?;
        let id = tx.last_insert_rowid();
        let timestamp: String = tx
            .query_row(
                "SELECT timestamp FROM airlab_readings WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .map_err(StorageError::from)?;
        tx.commit().map_err(StorageError::from)?;

        Ok(StoredRecord {
            id,
            timestamp,
            reading: reading.clone(),
        })
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM airlab_readings", [], |row| {
            row.get(0)
        })?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Most recent records, newest first.
    pub fn latest(&self, limit: usize) -> Result<Vec<StoredRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM airlab_readings ORDER BY id DESC LIMIT ?1"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map([limit], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Fetch one record by id.
    pub fn get(&self, id: i64) -> Result<Option<StoredRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM airlab_readings WHERE id = ?1"),
                [id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRecord> {
    let mut reading = Reading::new();
    for (offset, metric) in CanonicalMetric::ALL.iter().enumerate() {
        if let Some(value) = row.get::<_, Option<f64>>(offset + 2)? {
            reading.insert(*metric, value);
        }
    }
    Ok(StoredRecord {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        reading,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn reading(pairs: &[(CanonicalMetric, f64)]) -> Reading {
        pairs.iter().copied().collect()
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::linear(Duration::from_millis(1), 3)
    }

    fn temp_store(policy: RetryPolicy) -> (TempDir, std::path::PathBuf, ReadingStore) {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("data").join("airlab.db");
        let store = ReadingStore::open(&path, Duration::ZERO, policy).expect("open store");
        (dir, path, store)
    }

    /// Hold a write lock on `path` from another connection until told to release.
    fn hold_write_lock(path: &Path) -> (mpsc::Sender<()>, std::thread::JoinHandle<()>) {
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let path = path.to_path_buf();
        let handle = std::thread::spawn(move || {
            let conn = Connection::open(&path).expect("open locker");
            conn.execute_batch("BEGIN EXCLUSIVE").expect("take lock");
            locked_tx.send(()).expect("signal locked");
            let _ = release_rx.recv();
            conn.execute_batch("ROLLBACK").expect("release lock");
        });
        locked_rx.recv().expect("wait for lock");
        (release_tx, handle)
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();
        let index: String = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'index' AND name = 'idx_airlab_timestamp'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(index, "idx_airlab_timestamp");
    }

    #[test]
    fn insert_round_trips_partial_reading() {
        let (_dir, _path, store) = temp_store(fast_policy());
        let r = reading(&[
            (CanonicalMetric::Co2Ppm, 800.0),
            (CanonicalMetric::TemperatureC, 21.0),
        ]);

        let receipt = store.insert(&r).unwrap();
        assert_eq!(receipt.attempts, 1);
        assert!(!receipt.record.timestamp.is_empty());

        let stored = store.get(receipt.record.id).unwrap().expect("record exists");
        assert_eq!(stored.reading, r);
        assert_eq!(stored.reading.get(CanonicalMetric::HumidityPercent), None);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn ids_are_monotonic_and_latest_is_newest_first() {
        let (_dir, _path, store) = temp_store(fast_policy());
        for value in [700.0, 710.0, 720.0] {
            store
                .insert(&reading(&[(CanonicalMetric::Co2Ppm, value)]))
                .unwrap();
        }
        let latest = store.latest(2).unwrap();
        assert_eq!(latest.len(), 2);
        assert!(latest[0].id > latest[1].id);
        assert_eq!(latest[0].reading.get(CanonicalMetric::Co2Ppm), Some(720.0));
    }

    #[test]
    fn empty_reading_is_refused() {
        let (_dir, _path, store) = temp_store(fast_policy());
        assert!(matches!(store.insert(&Reading::new()), Err(Error::EmptyReading)));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn missing_table_fails_without_retry() {
        let conn = Connection::open_in_memory().unwrap();
        let store = ReadingStore::from_connection(conn, fast_policy());
        let err = store
            .insert(&reading(&[(CanonicalMetric::Co2Ppm, 800.0)]))
            .unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::Database(_))));
    }

    #[test]
    fn contention_on_every_attempt_fails_and_leaves_nothing() {
        let (_dir, path, store) = temp_store(fast_policy());
        let (release, handle) = hold_write_lock(&path);

        let err = store
            .insert(&reading(&[(CanonicalMetric::Co2Ppm, 800.0)]))
            .unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::Busy(_))));

        release.send(()).unwrap();
        handle.join().unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn contention_clears_before_second_attempt() {
        let (_dir, path, store) =
            temp_store(RetryPolicy::linear(Duration::from_millis(400), 3));
        let (release, handle) = hold_write_lock(&path);

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            release.send(()).unwrap();
        });

        let receipt = store
            .insert(&reading(&[(CanonicalMetric::TemperatureC, 21.0)]))
            .unwrap();
        releaser.join().unwrap();
        handle.join().unwrap();

        assert_eq!(receipt.attempts, 2);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn insert_async_runs_off_the_runtime() {
        let (_dir, _path, store) = temp_store(fast_policy());
        let receipt = store
            .insert_async(reading(&[(CanonicalMetric::VocIndex, 120.0)]))
            .await
            .unwrap();
        assert_eq!(receipt.record.reading.get(CanonicalMetric::VocIndex), Some(120.0));
    }
}
