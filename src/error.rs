//! Error types shared across the ingestion pipeline.
//!
//! Every failure the pipeline can hit is surfaced through one of these enums and then
//! logged or reported as a status event. None of them is fatal to the consumer loop.

use thiserror::Error;

/// Errors raised while loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to determine the home directory")]
    NoHomeDir,

    #[error("Config file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors from the connection manager.
///
/// The first three variants are configuration rejections raised before any network
/// attempt is made.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Broker host is required")]
    MissingHost,

    #[error("Topic is required")]
    MissingTopic,

    #[error("Port must be an integer between 1 and 65535, got '{0}'")]
    InvalidPort(String),

    #[error("MQTT client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Payload decoding failures. The message is dropped from buffering.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Payload is not valid JSON: {0}")]
    Malformed(String),

    #[error("Payload is not a JSON object")]
    NotAnObject,
}

/// Persistence and export failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Export worker failed: {0}")]
    Worker(String),
}

/// Errors returned to callers talking to the consumer pipeline from another task.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline is not running")]
    Closed,

    #[error("Pipeline dropped the request")]
    NoResponse,

    #[error(transparent)]
    Storage(#[from] StorageError),
}
