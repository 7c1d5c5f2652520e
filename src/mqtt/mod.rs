//! # MQTT Integration Module
//!
//! Everything that talks to the broker lives here. The rest of the crate only sees
//! [`message_manager::IngestEntry`] values coming out of the ingestion queue and the
//! [`mqtt_handler::ConnectionState`] of the current session.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Connection parameters and their validation
//! ├── message_manager.rs  - Raw messages, system events and the ingestion queue
//! ├── mqtt_handler.rs     - Session ownership and the connection state machine
//! └── command.rs          - Trigger to command mapping for outbound control messages
//! ```
//!
//! ## Threading
//!
//! Each session runs one network task polling the rumqttc event loop. That task may only
//! push into the ingestion queue or flip the connection state. Buffers, storage and
//! display values belong to the consumer pipeline in [`crate::telemetry`].
//!
//! ## Session Lifecycle
//!
//! ```text
//! Disconnected ──connect──► Connecting ──CONNACK ok──► Connected
//!      ▲                        │                          │
//!      │                        └──refused / io error──► Failed
//!      └──────────── disconnect / broker gone ─────────────┘
//! ```
//!
//! There is no automatic reconnect. A failed session stays `Failed` until the operator
//! connects again or disconnects.

pub mod command;
pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
