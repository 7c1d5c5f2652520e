use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use futures::TryStreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::store::ReadingStore;
use super::PersistedRecord;
use crate::error::StorageError;

pub const EXPORT_HEADER: [&str; 6] = [
    "timestamp",
    "topic",
    "payload",
    "temperature",
    "humidity",
    "gas_raw",
];

/// Rows in flight between the database stream and the file writer.
const EXPORT_CHUNK: usize = 256;

/// Writes every stored record to a CSV file at `path`. Returns the number of rows.
///
/// Rows are streamed from the store to a blocking writer, so memory use does not grow with
/// the size of the table.
pub async fn export_csv(store: &ReadingStore, path: &Path) -> Result<usize, StorageError> {
    let (tx, mut rx) = mpsc::channel::<PersistedRecord>(EXPORT_CHUNK);
    let target: PathBuf = path.to_path_buf();

    let writer = tokio::task::spawn_blocking(move || -> Result<usize, StorageError> {
        let file = File::create(&target)?;
        write_csv(file, std::iter::from_fn(|| rx.blocking_recv()))
    });

    let streamed = forward_rows(store, &tx).await;
    drop(tx);

    let rows = writer
        .await
        .map_err(|e| StorageError::Worker(e.to_string()))??;
    streamed?;

    info!("Exported {} records to {}", rows, path.display());
    Ok(rows)
}

async fn forward_rows(
    store: &ReadingStore,
    tx: &mpsc::Sender<PersistedRecord>,
) -> Result<(), StorageError> {
    let mut rows = store.stream();
    while let Some(record) = rows.try_next().await? {
        if tx.send(record).await.is_err() {
            debug!("Export writer stopped early");
            break;
        }
    }
    Ok(())
}

pub fn write_csv<W: io::Write>(
    writer: W,
    records: impl IntoIterator<Item = PersistedRecord>,
) -> Result<usize, StorageError> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(EXPORT_HEADER)?;
    let mut rows = 0;
    for record in records {
        let temperature = optional(record.temperature);
        let humidity = optional(record.humidity);
        let gas = optional(record.gas);
        csv.write_record([
            record.timestamp.as_str(),
            record.topic.as_str(),
            record.payload.as_str(),
            temperature.as_str(),
            humidity.as_str(),
            gas.as_str(),
        ])?;
        rows += 1;
    }
    csv.flush()?;
    Ok(rows)
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_values_are_empty_and_payload_is_quoted() {
        let records = vec![PersistedRecord {
            timestamp: "2024-05-01 10:00:00".into(),
            topic: "home/air/esp01/data".into(),
            temperature: Some(21.5),
            humidity: None,
            gas: Some(310.0),
            payload: r#"{"temperature":21.5,"gas_raw":310}"#.into(),
        }];

        let mut out = Vec::new();
        assert_eq!(write_csv(&mut out, records).unwrap(), 1);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "timestamp,topic,payload,temperature,humidity,gas_raw");
        assert_eq!(
            lines[1],
            r#"2024-05-01 10:00:00,home/air/esp01/data,"{""temperature"":21.5,""gas_raw"":310}",21.5,,310"#
        );
    }

    #[tokio::test]
    async fn export_writes_file_in_storage_order() {
        let store = ReadingStore::in_memory().await.unwrap();
        for (ts, value) in [("2024-05-01 10:00:00", 1.0), ("2024-05-01 10:00:01", 2.0)] {
            store
                .append(&PersistedRecord {
                    timestamp: ts.into(),
                    topic: "t".into(),
                    temperature: Some(value),
                    humidity: None,
                    gas: None,
                    payload: "{}".into(),
                })
                .await
                .unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.csv");
        assert_eq!(export_csv(&store, &path).await.unwrap(), 2);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let temps: Vec<String> = reader
            .records()
            .map(|row| row.unwrap()[3].to_string())
            .collect();
        assert_eq!(temps, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn export_streams_tables_larger_than_one_chunk() {
        let store = ReadingStore::in_memory().await.unwrap();
        let total = EXPORT_CHUNK * 2 + 7;
        for i in 0..total {
            store
                .append(&PersistedRecord {
                    timestamp: "2024-05-01 10:00:00".into(),
                    topic: "t".into(),
                    temperature: None,
                    humidity: Some(i as f64),
                    gas: None,
                    payload: "{}".into(),
                })
                .await
                .unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("large.csv");
        assert_eq!(export_csv(&store, &path).await.unwrap(), total);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let humidity: Vec<String> = reader
            .records()
            .map(|row| row.unwrap()[4].to_string())
            .collect();
        assert_eq!(humidity.len(), total);
        assert_eq!(humidity[0], "0");
        assert_eq!(humidity[total - 1], (total - 1).to_string());
    }

    #[tokio::test]
    async fn export_to_missing_directory_fails() {
        let store = ReadingStore::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.csv");

        let err = export_csv(&store, &path).await.unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
    }
}
