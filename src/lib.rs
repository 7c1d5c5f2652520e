//! Sensor telemetry ingestion over MQTT.
//!
//! The network side ([`mqtt`]) pushes messages and connection events onto a bounded queue.
//! A single tick-driven consumer ([`telemetry::pipeline`]) decodes them, keeps a bounded
//! history per metric and appends every message to the SQLite store ([`persistence`]).

pub mod config;
pub mod error;
pub mod mqtt;
pub mod persistence;
pub mod telemetry;
