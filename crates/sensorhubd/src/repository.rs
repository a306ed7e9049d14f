//! Reading persistence
//!
//! Schema:
//! - readings: device id, provider timestamp, fetch time, canonical fields (JSON), digest

use async_trait::async_trait;
use rusqlite::{params, Connection};
use sensorhub_common::Reading;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Batched reading writes
#[async_trait]
pub trait ReadingRepository: Send + Sync {
    /// Persist the whole batch, or nothing
    async fn write_readings_batch(&self, readings: &[Reading]) -> Result<(), RepositoryError>;
}

/// SQLite-backed repository
pub struct SqliteReadingRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteReadingRepository {
    /// Open or create the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL keeps readers unblocked during batch writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init_schema(&conn)?;

        info!("Reading store opened at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, RepositoryError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), RepositoryError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                observed_at TEXT,
                fetched_at TEXT NOT NULL,
                fields TEXT NOT NULL,
                digest TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_readings_device_time ON readings(device_id, fetched_at);
            "#,
        )?;
        Ok(())
    }

    /// Rows stored for `device_id`
    pub async fn count_for(&self, device_id: &str) -> Result<u64, RepositoryError> {
        let conn = Arc::clone(&self.conn);
        let device_id = device_id.to_string();

        run_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM readings WHERE device_id = ?1",
                params![device_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T, RepositoryError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, RepositoryError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| RepositoryError::Unavailable(format!("storage task failed: {}", e)))?
}

#[async_trait]
impl ReadingRepository for SqliteReadingRepository {
    async fn write_readings_batch(&self, readings: &[Reading]) -> Result<(), RepositoryError> {
        if readings.is_empty() {
            return Ok(());
        }

        let conn = Arc::clone(&self.conn);
        let readings = readings.to_vec();

        run_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO readings (device_id, observed_at, fetched_at, fields, digest)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;

                for reading in &readings {
                    let fields = serde_json::to_string(&reading.fields)?;
                    stmt.execute(params![
                        &reading.device_id,
                        reading.observed_at,
                        reading.fetched_at,
                        fields,
                        &reading.digest
                    ])?;
                }
            }
            tx.commit()?;
            debug!("Stored {} readings", readings.len());
            Ok(())
        })
        .await
    }
}

/// Keeps batches in memory; used by tests and dry runs
#[derive(Default)]
pub struct MemoryReadingRepository {
    batches: Mutex<Vec<Vec<Reading>>>,
    /// Remaining writes that fail before writes succeed again
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemoryReadingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `failures` writes
    pub fn failing(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    pub fn batches(&self) -> Vec<Vec<Reading>> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn total_readings(&self) -> usize {
        self.batches().iter().map(Vec::len).sum()
    }

    /// Every write call, failed ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadingRepository for MemoryReadingRepository {
    async fn write_readings_batch(&self, readings: &[Reading]) -> Result<(), RepositoryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RepositoryError::Unavailable("injected failure".into()));
        }

        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(readings.to_vec());
        Ok(())
    }
}
