//! # Persistence Module
//!
//! Durable, append-only storage of every ingested message and CSV export of the stored
//! rows.
//!
//! ## Key Abstractions
//! - **[`PersistedRecord`]**: one row, the raw payload plus whichever metrics decoded
//! - **[`store::ReadingStore`]**: SQLite table behind an sqlx pool; rows are only ever inserted
//! - **[`ReadingSink`]**: the consumer's write path, applying the [`PersistPolicy`]
//! - **[`export`]**: flat CSV dump in storage order
//!
//! ## Error Handling Strategy
//! Writes are best-effort. A failed insert is logged and counted by the sink, and the
//! in-memory reading stays where it is. Nothing is retried or rolled back.

pub mod export;
pub mod store;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::mqtt::message_manager::RawMessage;
use crate::telemetry::decoder::DecodedPayload;
use store::ReadingStore;

/// Local time format of the `timestamp` column and export.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Which data messages end up in the store.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PersistPolicy {
    /// Every data message, including ones that failed to decode
    #[default]
    All,
    /// Only messages with at least one valid metric
    Decoded,
}

impl PersistPolicy {
    pub fn admits(self, decoded: Option<&DecodedPayload>) -> bool {
        match self {
            PersistPolicy::All => true,
            PersistPolicy::Decoded => decoded.is_some_and(DecodedPayload::has_valid_metric),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRecord {
    pub timestamp: String,
    pub topic: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub gas: Option<f64>,
    pub payload: String,
}

impl PersistedRecord {
    pub fn from_message(message: &RawMessage, decoded: Option<&DecodedPayload>) -> Self {
        Self {
            timestamp: message.received_at.format(TIMESTAMP_FORMAT).to_string(),
            topic: message.topic.clone(),
            temperature: decoded.and_then(|d| d.temperature.value()),
            humidity: decoded.and_then(|d| d.humidity.value()),
            gas: decoded.and_then(|d| d.gas_raw.value()),
            payload: message.payload.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub written: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// The consumer's handle on the store.
#[derive(Debug)]
pub struct ReadingSink {
    store: ReadingStore,
    policy: PersistPolicy,
    stats: SinkStats,
}

impl ReadingSink {
    pub fn new(store: ReadingStore, policy: PersistPolicy) -> Self {
        info!("Persisting data messages with policy {:?}", policy);
        Self {
            store,
            policy,
            stats: SinkStats::default(),
        }
    }

    pub fn store(&self) -> &ReadingStore {
        &self.store
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    /// Stores one message according to the policy. Failures are logged, never returned.
    pub async fn persist(&mut self, message: &RawMessage, decoded: Option<&DecodedPayload>) {
        if !self.policy.admits(decoded) {
            debug!("Policy {:?} skips message on {}", self.policy, message.topic);
            self.stats.skipped += 1;
            return;
        }

        let record = PersistedRecord::from_message(message, decoded);
        match self.store.append(&record).await {
            Ok(id) => {
                debug!("Stored record {} from {}", id, record.topic);
                self.stats.written += 1;
            }
            Err(e) => {
                error!("Failed to store message from {}: {}", record.topic, e);
                self.stats.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::decoder::decode;

    #[test]
    fn record_carries_only_valid_metrics() {
        let message = RawMessage::new("home/air/esp01/data", r#"{"temperature":nan,"humidity":41.2}"#);
        let decoded = decode(&message.payload).unwrap();
        let record = PersistedRecord::from_message(&message, Some(&decoded));

        assert_eq!(record.temperature, None);
        assert_eq!(record.humidity, Some(41.2));
        assert_eq!(record.gas, None);
        assert_eq!(record.payload, message.payload);
        assert_eq!(record.timestamp.len(), "YYYY-MM-DD HH:MM:SS".len());
    }

    #[test]
    fn policy_decides_on_decode_outcome() {
        let valid = decode(r#"{"gas_raw":12}"#).unwrap();
        let empty = decode(r#"{"temperature":null}"#).unwrap();

        assert!(PersistPolicy::All.admits(None));
        assert!(PersistPolicy::All.admits(Some(&empty)));
        assert!(PersistPolicy::Decoded.admits(Some(&valid)));
        assert!(!PersistPolicy::Decoded.admits(Some(&empty)));
        assert!(!PersistPolicy::Decoded.admits(None));
    }

    #[tokio::test]
    async fn sink_counts_writes_and_skips() {
        let store = ReadingStore::in_memory().await.unwrap();
        let mut sink = ReadingSink::new(store, PersistPolicy::Decoded);

        let good = RawMessage::new("t", r#"{"temperature":20}"#);
        let bad = RawMessage::new("t", "garbage");
        sink.persist(&good, Some(&decode(&good.payload).unwrap())).await;
        sink.persist(&bad, None).await;

        assert_eq!(
            sink.stats(),
            SinkStats {
                written: 1,
                skipped: 1,
                failed: 0
            }
        );
        assert_eq!(sink.store().count().await.unwrap(), 1);
    }
}
