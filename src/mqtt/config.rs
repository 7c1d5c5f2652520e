use crate::error::ConnectError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Everything needed to open one broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub credentials: Option<Credentials>,
}

impl ConnectionParams {
    /// Builds parameters from raw operator input.
    ///
    /// Host, topic and username are trimmed, the password is taken verbatim. An empty
    /// username means anonymous access.
    pub fn parse(
        host: &str,
        port: &str,
        topic: &str,
        username: &str,
        password: &str,
    ) -> Result<Self, ConnectError> {
        let port_text = port.trim();
        let port = match port_text.parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => return Err(ConnectError::InvalidPort(port_text.to_string())),
        };

        let username = username.trim();
        let credentials = (!username.is_empty()).then(|| Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });

        let params = Self {
            host: host.trim().to_string(),
            port,
            topic: topic.trim().to_string(),
            credentials,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ConnectError> {
        if self.host.trim().is_empty() {
            return Err(ConnectError::MissingHost);
        }
        if self.port == 0 {
            return Err(ConnectError::InvalidPort(self.port.to_string()));
        }
        if self.topic.trim().is_empty() {
            return Err(ConnectError::MissingTopic);
        }
        Ok(())
    }
}

/// Client identifier for a new session, unique per connect call.
pub fn session_client_id() -> String {
    format!("airfeed-{}", chrono::Local::now().timestamp_millis())
}
