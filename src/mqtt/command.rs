//! Outbound setpoint commands.
//!
//! A fixed set of triggers maps to `ACTION:<step>` strings published on the device's
//! command topic. Publishing is fire-and-forget and silently skipped unless connected.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, info};

use super::mqtt_handler::{ConnectionManager, PublishOutcome};
use crate::config::CommandSettings;
use crate::error::ConnectError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandTrigger {
    IncreaseTemperature,
    DecreaseTemperature,
    IncreaseHumidity,
    DecreaseHumidity,
}

impl CommandTrigger {
    pub const ALL: [CommandTrigger; 4] = [
        CommandTrigger::IncreaseTemperature,
        CommandTrigger::DecreaseTemperature,
        CommandTrigger::IncreaseHumidity,
        CommandTrigger::DecreaseHumidity,
    ];

    pub fn identifier(self) -> &'static str {
        match self {
            CommandTrigger::IncreaseTemperature => "inc",
            CommandTrigger::DecreaseTemperature => "dec",
            CommandTrigger::IncreaseHumidity => "hum_inc",
            CommandTrigger::DecreaseHumidity => "hum_dec",
        }
    }

    fn action(self) -> &'static str {
        match self {
            CommandTrigger::IncreaseTemperature => "INC",
            CommandTrigger::DecreaseTemperature => "DEC",
            CommandTrigger::IncreaseHumidity => "HUM_INC",
            CommandTrigger::DecreaseHumidity => "HUM_DEC",
        }
    }
}

impl fmt::Display for CommandTrigger {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown command trigger '{0}'")]
pub struct UnknownTrigger(pub String);

impl FromStr for CommandTrigger {
    type Err = UnknownTrigger;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        CommandTrigger::ALL
            .into_iter()
            .find(|trigger| trigger.identifier() == wanted)
            .ok_or_else(|| UnknownTrigger(s.to_string()))
    }
}

/// Replaces the last level of the data topic with `suffix`.
///
/// `home/air/esp01/data` with suffix `cmd` becomes `home/air/esp01/cmd`. A single-level
/// topic is treated as the namespace itself.
pub fn command_topic(data_topic: &str, suffix: &str) -> String {
    let namespace = match data_topic.rsplit_once('/') {
        Some((namespace, _)) => namespace,
        None => data_topic,
    };
    format!("{}/{}", namespace, suffix)
}

#[derive(Debug, Clone)]
pub struct CommandPublisher {
    temperature_step: f64,
    humidity_step: f64,
    suffix: String,
}

impl CommandPublisher {
    pub fn new(settings: &CommandSettings, suffix: impl Into<String>) -> Self {
        Self {
            temperature_step: settings.temperature_step,
            humidity_step: settings.humidity_step,
            suffix: suffix.into(),
        }
    }

    pub fn command_for(&self, trigger: CommandTrigger) -> String {
        let step = match trigger {
            CommandTrigger::IncreaseTemperature | CommandTrigger::DecreaseTemperature => {
                self.temperature_step
            }
            CommandTrigger::IncreaseHumidity | CommandTrigger::DecreaseHumidity => {
                self.humidity_step
            }
        };
        format!("{}:{}", trigger.action(), step)
    }

    /// Publishes the command for `trigger` if the manager has a connected session.
    pub fn fire(
        &self,
        manager: &ConnectionManager,
        trigger: CommandTrigger,
    ) -> Result<PublishOutcome, ConnectError> {
        let Some(data_topic) = manager.active_topic() else {
            debug!("Trigger {} ignored, no session", trigger);
            return Ok(PublishOutcome::Skipped);
        };

        let topic = command_topic(data_topic, &self.suffix);
        let command = self.command_for(trigger);
        let outcome = manager.publish(&topic, command.clone())?;
        match outcome {
            PublishOutcome::Published => info!("Sent {} to {}", command, topic),
            PublishOutcome::Skipped => {
                debug!("Trigger {} ignored, state is {:?}", trigger, manager.state())
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::ConnectionParams;
    use crate::mqtt::message_manager::ingest_queue;
    use rumqttc::{ConnAck, ConnectReturnCode, Event, Packet};
    use std::time::Duration;

    fn publisher() -> CommandPublisher {
        CommandPublisher::new(&CommandSettings::default(), "cmd")
    }

    #[test]
    fn triggers_map_to_commands() {
        let publisher = publisher();
        assert_eq!(
            publisher.command_for(CommandTrigger::IncreaseTemperature),
            "INC:0.5"
        );
        assert_eq!(
            publisher.command_for(CommandTrigger::DecreaseTemperature),
            "DEC:0.5"
        );
        assert_eq!(
            publisher.command_for(CommandTrigger::IncreaseHumidity),
            "HUM_INC:1"
        );
        assert_eq!(
            publisher.command_for(CommandTrigger::DecreaseHumidity),
            "HUM_DEC:1"
        );
    }

    #[test]
    fn trigger_identifiers_parse() {
        for trigger in CommandTrigger::ALL {
            assert_eq!(trigger.identifier().parse::<CommandTrigger>(), Ok(trigger));
        }
        assert_eq!("HUM_INC".parse::<CommandTrigger>(), Ok(CommandTrigger::IncreaseHumidity));
        let err = "warmer".parse::<CommandTrigger>().unwrap_err();
        assert_eq!(err, UnknownTrigger("warmer".to_string()));
        assert_eq!(err.to_string(), "unknown command trigger 'warmer'");
    }

    #[test]
    fn command_topic_uses_device_namespace() {
        assert_eq!(command_topic("home/air/esp01/data", "cmd"), "home/air/esp01/cmd");
        assert_eq!(command_topic("sensor", "cmd"), "sensor/cmd");
    }

    #[tokio::test]
    async fn triggers_are_noops_until_connected() {
        let (producer, _consumer) = ingest_queue(16);
        let mut manager = ConnectionManager::new(producer, Duration::from_secs(60));
        let publisher = publisher();

        for trigger in CommandTrigger::ALL {
            assert_eq!(
                publisher.fire(&manager, trigger).unwrap(),
                PublishOutcome::Skipped
            );
        }

        let params =
            ConnectionParams::parse("127.0.0.1", "1883", "home/air/esp01/data", "", "").unwrap();
        let _eventloop = manager.attach_offline_session(params);
        assert_eq!(
            publisher
                .fire(&manager, CommandTrigger::IncreaseTemperature)
                .unwrap(),
            PublishOutcome::Skipped
        );
        assert_eq!(manager.status().messages_sent, 0);

        manager.inject(Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        })));
        assert_eq!(
            publisher
                .fire(&manager, CommandTrigger::IncreaseTemperature)
                .unwrap(),
            PublishOutcome::Published
        );
        assert_eq!(manager.status().messages_sent, 1);
    }
}
