//! Application configuration.
//!
//! Loaded from a TOML file under the user's config directory. Every section falls back to
//! defaults so a partial file (or none at all) still yields a runnable setup.

use crate::error::ConfigError;
use crate::mqtt::config::{ConnectionParams, Credentials};
use crate::persistence::PersistPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/airfeed";
const CONFIG_FILE: &str = "config.toml";
const DATA_DIR: &str = ".local/share/airfeed";
const DATABASE_FILE: &str = "readings.db";
const CONFIG_ENV: &str = "AIRFEED_CONFIG";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub mqtt: MqttSettings,
    pub pipeline: PipelineSettings,
    pub storage: StorageSettings,
    pub commands: CommandSettings,
}

/// Broker connection settings.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    /// Data topic the device publishes telemetry on
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// Last topic level used for outbound commands, replacing the data topic's last level
    pub command_suffix: String,
    /// Connect right after startup instead of waiting for the `connect` console command
    pub auto_connect: bool,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            topic: "home/air/esp01/data".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 60,
            command_suffix: "cmd".to_string(),
            auto_connect: true,
        }
    }
}

impl MqttSettings {
    /// Builds validated connection parameters from the configured values.
    pub fn connection_params(&self) -> Result<ConnectionParams, crate::error::ConnectError> {
        let credentials = self.username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: self.password.clone().unwrap_or_default(),
        });
        let params = ConnectionParams {
            host: self.host.trim().to_string(),
            port: self.port,
            topic: self.topic.trim().to_string(),
            credentials,
        };
        params.validate()?;
        Ok(params)
    }
}

/// Consumer pipeline tuning.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PipelineSettings {
    /// Points retained per metric
    pub buffer_capacity: usize,
    /// Consumer tick interval
    pub poll_interval_ms: u64,
    /// Ingestion queue bound; oldest entries are dropped beyond it
    pub queue_capacity: usize,
    /// Number of log lines kept for the display view
    pub log_tail_len: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 600,
            poll_interval_ms: 200,
            queue_capacity: 10_000,
            log_tail_len: 200,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub database_path: PathBuf,
    pub persist_policy: PersistPolicy,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: home_dir().join(DATA_DIR).join(DATABASE_FILE),
            persist_policy: PersistPolicy::default(),
        }
    }
}

/// Magnitudes attached to outbound setpoint commands.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CommandSettings {
    pub temperature_step: f64,
    pub humidity_step: f64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            temperature_step: 0.5,
            humidity_step: 1.0,
        }
    }
}

impl AppConfig {
    /// Resolves the config file location, honouring `AIRFEED_CONFIG` when set.
    pub fn default_path() -> PathBuf {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => home_dir().join(CONFIG_DIR).join(CONFIG_FILE),
        }
    }

    /// Writes the default configuration to `path` unless a file already exists there.
    pub async fn ensure_default_config(path: &Path) -> Result<(), ConfigError> {
        if tokio::fs::try_exists(path).await? {
            debug!("Config file {} already exists", path.display());
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(&AppConfig::default())?;
        tokio::fs::write(path, content).await?;
        info!("Wrote default config to {}", path.display());
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::from_toml(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.port == 0 {
            return Err(ConfigError::Invalid("mqtt.port must be non-zero".into()));
        }
        // the CONNECT packet carries keep-alive as a u16
        if self.mqtt.keep_alive_secs > u64::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "mqtt.keep_alive_secs must be at most {}, got {}",
                u16::MAX,
                self.mqtt.keep_alive_secs
            )));
        }
        if self.pipeline.buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.buffer_capacity must be at least 1".into(),
            ));
        }
        if self.pipeline.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.poll_interval_ms must be at least 1".into(),
            ));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.queue_capacity must be at least 1".into(),
            ));
        }
        for (name, step) in [
            ("commands.temperature_step", self.commands.temperature_step),
            ("commands.humidity_step", self.commands.humidity_step),
        ] {
            if !step.is_finite() || step <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a positive number, got {}",
                    name, step
                )));
            }
        }
        if self.mqtt.command_suffix.trim().is_empty() {
            warn!("mqtt.command_suffix is empty, commands will go to the device namespace root");
        }
        Ok(())
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_dashboard_settings() {
        let config = AppConfig::default();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert_eq!(config.pipeline.buffer_capacity, 600);
        assert_eq!(config.pipeline.poll_interval_ms, 200);
        assert_eq!(config.storage.persist_policy, PersistPolicy::All);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [mqtt]
            host = "broker.local"
            topic = "lab/air/dev7/data"

            [pipeline]
            buffer_capacity = 32
            "#,
        )
        .unwrap();

        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.pipeline.buffer_capacity, 32);
        assert_eq!(config.pipeline.poll_interval_ms, 200);
        assert_eq!(config.commands, CommandSettings::default());
    }

    #[test]
    fn rejects_zero_capacity_and_bad_steps() {
        let err = AppConfig::from_toml("[pipeline]\nbuffer_capacity = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = AppConfig::from_toml("[commands]\ntemperature_step = -1.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn keep_alive_must_fit_the_connect_packet() {
        let config = AppConfig::from_toml("[mqtt]\nkeep_alive_secs = 65535\n").unwrap();
        assert_eq!(config.mqtt.keep_alive_secs, 65535);

        let err = AppConfig::from_toml("[mqtt]\nkeep_alive_secs = 65536\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn credentials_only_when_username_set() {
        let mut settings = MqttSettings::default();
        assert!(settings.connection_params().unwrap().credentials.is_none());

        settings.username = Some("esp01".into());
        settings.password = Some("pass".into());
        let creds = settings.connection_params().unwrap().credentials.unwrap();
        assert_eq!(creds.username, "esp01");
        assert_eq!(creds.password, "pass");
    }

    #[tokio::test]
    async fn default_config_is_written_once_and_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        AppConfig::ensure_default_config(&path).await.unwrap();
        let loaded = AppConfig::load(&path).await.unwrap();
        assert_eq!(loaded, AppConfig::default());

        tokio::fs::write(&path, "[mqtt]\nport = 8883\n").await.unwrap();
        AppConfig::ensure_default_config(&path).await.unwrap();
        let loaded = AppConfig::load(&path).await.unwrap();
        assert_eq!(loaded.mqtt.port, 8883);
    }
}
