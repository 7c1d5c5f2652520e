use std::path::Path;
use std::str::FromStr;

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use super::PersistedRecord;
use crate::error::StorageError;

const CREATE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS readings (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   TEXT NOT NULL,
    topic       TEXT NOT NULL,
    temperature REAL,
    humidity    REAL,
    gas         REAL,
    payload     TEXT NOT NULL
);
"#;

const SELECT_RECORDS: &str = "SELECT timestamp, topic, temperature, humidity, gas, payload \
                              FROM readings ORDER BY id";

#[derive(sqlx::FromRow)]
struct RecordRow {
    timestamp: String,
    topic: String,
    temperature: Option<f64>,
    humidity: Option<f64>,
    gas: Option<f64>,
    payload: String,
}

impl From<RecordRow> for PersistedRecord {
    fn from(row: RecordRow) -> Self {
        Self {
            timestamp: row.timestamp,
            topic: row.topic,
            temperature: row.temperature,
            humidity: row.humidity,
            gas: row.gas,
            payload: row.payload,
        }
    }
}

/// Append-only reading table.
#[derive(Debug, Clone)]
pub struct ReadingStore {
    pool: SqlitePool,
}

impl ReadingStore {
    /// Opens (creating if needed) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        // the consumer is the only writer
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_schema().await?;
        info!("Opened reading store at {}", path.display());
        Ok(store)
    }

    /// A private in-memory database, gone when the store is dropped.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // an in-memory database lives only as long as its single connection
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<(), StorageError> {
        sqlx::query(CREATE_SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Inserts one record and returns its row id.
    pub async fn append(&self, record: &PersistedRecord) -> Result<i64, StorageError> {
        let result = sqlx::query(
            "INSERT INTO readings (timestamp, topic, temperature, humidity, gas, payload) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.timestamp)
        .bind(&record.topic)
        .bind(record.temperature)
        .bind(record.humidity)
        .bind(record.gas)
        .bind(&record.payload)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// All records in insertion order.
    pub async fn records(&self) -> Result<Vec<PersistedRecord>, StorageError> {
        let rows = sqlx::query_as::<_, RecordRow>(SELECT_RECORDS)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(PersistedRecord::from).collect())
    }

    /// Records in insertion order, fetched row by row.
    pub fn stream(&self) -> BoxStream<'_, Result<PersistedRecord, StorageError>> {
        sqlx::query_as::<_, RecordRow>(SELECT_RECORDS)
            .fetch(&self.pool)
            .map_ok(PersistedRecord::from)
            .map_err(StorageError::from)
            .boxed()
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
