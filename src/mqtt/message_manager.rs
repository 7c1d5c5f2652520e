//! Ingestion queue between the network task and the consumer pipeline.
//!
//! The network side only ever pushes [`IngestEntry`] values; the consumer drains them in
//! order on its tick. The queue is bounded and never blocks a producer: once full, the
//! oldest entries are overwritten and the consumer is told how many it missed.

use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

/// One message as received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub received_at: DateTime<Local>,
    pub topic: String,
    pub payload: String,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            received_at: Local::now(),
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Builds a message from wire bytes, replacing invalid UTF-8 sequences.
    pub fn from_bytes(topic: impl Into<String>, payload: &[u8]) -> Self {
        Self::new(topic, String::from_utf8_lossy(payload).into_owned())
    }

    pub fn render(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.received_at.format("%H:%M:%S"),
            self.topic,
            self.payload
        )
    }
}

/// Connection lifecycle notices produced by the connection manager and network task.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemEvent {
    ConnectIssued { host: String, port: u16 },
    Connected,
    Subscribed { topic: String },
    SubscribeFailed { topic: String, reason: String },
    /// `code` carries the broker's CONNACK return code when one was received
    ConnectFailed { reason: String, code: Option<u8> },
    Disconnected,
    Log(String),
}

impl fmt::Display for SystemEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SystemEvent::ConnectIssued { host, port } => {
                write!(f, "CONNECT_ISSUED {}:{}", host, port)
            }
            SystemEvent::Connected => write!(f, "CONNECTED"),
            SystemEvent::Subscribed { topic } => write!(f, "SUBSCRIBED {}", topic),
            SystemEvent::SubscribeFailed { topic, reason } => {
                write!(f, "SUBSCRIBE FAILED {}: {}", topic, reason)
            }
            SystemEvent::ConnectFailed {
                code: Some(code), ..
            } => write!(f, "CONNECT FAILED rc={}", code),
            SystemEvent::ConnectFailed { reason, code: None } => {
                write!(f, "CONNECT FAILED: {}", reason)
            }
            SystemEvent::Disconnected => write!(f, "DISCONNECTED"),
            SystemEvent::Log(line) => write!(f, "MQTT log: {}", line),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestEntry {
    System {
        event: SystemEvent,
        at: DateTime<Local>,
    },
    Data(RawMessage),
}

/// Creates the ingestion queue.
///
/// The bound is rounded up to the next power of two by the underlying channel.
pub fn ingest_queue(capacity: usize) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = broadcast::channel(capacity.max(1));
    (QueueProducer { tx }, QueueConsumer { rx })
}

/// Cloneable, non-blocking handle for the network side.
#[derive(Debug, Clone)]
pub struct QueueProducer {
    tx: broadcast::Sender<IngestEntry>,
}

impl QueueProducer {
    pub fn push_system(&self, event: SystemEvent) {
        self.push(IngestEntry::System {
            event,
            at: Local::now(),
        });
    }

    pub fn push_data(&self, message: RawMessage) {
        self.push(IngestEntry::Data(message));
    }

    pub fn push(&self, entry: IngestEntry) {
        if self.tx.send(entry).is_err() {
            debug!("Ingestion queue has no consumer, entry discarded");
        }
    }
}

/// Result of draining the queue once.
#[derive(Debug, Default)]
pub struct Drain {
    pub entries: Vec<IngestEntry>,
    /// Entries overwritten before the consumer reached them
    pub dropped: u64,
    /// All producers are gone
    pub closed: bool,
}

#[derive(Debug)]
pub struct QueueConsumer {
    rx: broadcast::Receiver<IngestEntry>,
}

impl QueueConsumer {
    /// Takes every entry currently queued without waiting for more.
    pub fn drain(&mut self) -> Drain {
        let mut drain = Drain::default();
        loop {
            match self.rx.try_recv() {
                Ok(entry) => drain.entries.push(entry),
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Lagged(missed)) => drain.dropped += missed,
                Err(broadcast::error::TryRecvError::Closed) => {
                    drain.closed = true;
                    break;
                }
            }
        }
        drain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_push_order() {
        let (producer, mut consumer) = ingest_queue(16);
        producer.push_system(SystemEvent::Connected);
        producer.push_data(RawMessage::new("a", "1"));
        producer.push_data(RawMessage::new("b", "2"));

        let drain = consumer.drain();
        assert_eq!(drain.entries.len(), 3);
        assert_eq!(drain.dropped, 0);
        assert!(matches!(
            &drain.entries[0],
            IngestEntry::System { event: SystemEvent::Connected, .. }
        ));
        match (&drain.entries[1], &drain.entries[2]) {
            (IngestEntry::Data(first), IngestEntry::Data(second)) => {
                assert_eq!(first.topic, "a");
                assert_eq!(second.topic, "b");
            }
            other => panic!("unexpected entries {:?}", other),
        }

        assert!(consumer.drain().entries.is_empty());
    }

    #[test]
    fn overflow_drops_oldest_and_reports_count() {
        let (producer, mut consumer) = ingest_queue(4);
        for i in 0..6 {
            producer.push_data(RawMessage::new("t", i.to_string()));
        }

        let drain = consumer.drain();
        assert_eq!(drain.dropped, 2);
        let payloads: Vec<_> = drain
            .entries
            .iter()
            .map(|entry| match entry {
                IngestEntry::Data(msg) => msg.payload.clone(),
                other => panic!("unexpected entry {:?}", other),
            })
            .collect();
        assert_eq!(payloads, vec!["2", "3", "4", "5"]);
    }

    #[test]
    fn drain_reports_closed_queue() {
        let (producer, mut consumer) = ingest_queue(4);
        producer.push_system(SystemEvent::Disconnected);
        drop(producer);

        let drain = consumer.drain();
        assert_eq!(drain.entries.len(), 1);
        assert!(drain.closed);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let msg = RawMessage::from_bytes("t", &[b'{', 0xff, b'}']);
        assert_eq!(msg.payload, "{\u{fffd}}");
    }

    #[test]
    fn system_events_render_like_status_tokens() {
        let failed = SystemEvent::ConnectFailed {
            reason: "refused".into(),
            code: Some(5),
        };
        assert_eq!(failed.to_string(), "CONNECT FAILED rc=5");
        assert_eq!(
            SystemEvent::Subscribed { topic: "x/y".into() }.to_string(),
            "SUBSCRIBED x/y"
        );
    }
}
