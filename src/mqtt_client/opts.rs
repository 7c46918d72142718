use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::mqttv3::connect::Will;
use crate::mqtt_serde::{MQTT_V31, MQTT_V311};

use super::error::MqttClientError;

/// Per-connection options carried in CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttClientOptions {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<Will>,
    // --------------------------
    // Session
    // --------------------------
    // if true, the broker and the local session both start empty
    // if false, unfinished QoS 1/2 handshakes are resumed
    // default: true
    pub clean_session: bool,
    /// Seconds; 0 disables keep-alive.
    pub keep_alive: u16,
    /// 3 (MQTT 3.1) or 4 (MQTT 3.1.1).
    pub protocol_version: u8,
}

impl Default for MqttClientOptions {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            username: None,
            password: None,
            will: None,
            clean_session: true,
            keep_alive: 60,
            protocol_version: MQTT_V311,
        }
    }
}

impl MqttClientOptions {
    pub fn builder() -> MqttClientOptionsBuilder {
        MqttClientOptionsBuilder::default()
    }

    pub fn keep_alive_period(&self) -> Option<Duration> {
        (self.keep_alive > 0).then(|| Duration::from_secs(self.keep_alive as u64))
    }

    /// Checks what can be checked before a single byte is written.
    pub fn validate(&self) -> Result<(), MqttClientError> {
        if !matches!(self.protocol_version, MQTT_V31 | MQTT_V311) {
            return Err(MqttClientError::invalid_argument(
                "protocol_version",
                format!("{} is not 3 or 4", self.protocol_version),
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(MqttClientError::invalid_argument(
                "password",
                "a password requires a username",
            ));
        }
        if let Some(will) = &self.will {
            if will.qos > 2 {
                return Err(MqttClientError::invalid_argument(
                    "will.qos",
                    format!("{} is not a QoS level", will.qos),
                ));
            }
            crate::mqtt_serde::validate_topic_name(&will.topic)
                .map_err(|e| MqttClientError::invalid_argument("will.topic", e.to_string()))?;
        }
        if self.client_id.is_empty() && !self.clean_session {
            return Err(MqttClientError::invalid_argument(
                "client_id",
                "an empty client id requires a clean session",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MqttClientOptionsBuilder {
    options: MqttClientOptions,
}

impl MqttClientOptionsBuilder {
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.options.client_id = client_id.into();
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.options.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.options.password = Some(password.into());
        self
    }

    pub fn will(mut self, will: Will) -> Self {
        self.options.will = Some(will);
        self
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.options.clean_session = clean_session;
        self
    }

    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.options.keep_alive = seconds;
        self
    }

    pub fn protocol_version(mut self, version: u8) -> Self {
        self.options.protocol_version = version;
        self
    }

    pub fn build(self) -> MqttClientOptions {
        self.options
    }
}

/// Engine tuning, fixed for the lifetime of an [`MqttClient`](super::MqttClient).
///
/// Every field has a default, so a partial JSON document such as
/// `{"max_attempts": 5}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// How long a sent packet waits for its acknowledgment before a resend.
    pub retry_delay_ms: u64,
    /// Total sends of one handshake step before the delivery is abandoned.
    pub max_attempts: u32,
    /// Deliveries the inflight queue holds, both directions together.
    pub inflight_capacity: usize,
    /// CONNACK wait, and the read timeout once a packet has started arriving.
    pub response_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry_delay_ms: 10_000,
            max_attempts: 3,
            inflight_capacity: 65_535,
            response_timeout_ms: 30_000,
        }
    }
}

impl EngineSettings {
    pub fn builder() -> EngineSettingsBuilder {
        EngineSettingsBuilder::default()
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), MqttClientError> {
        if self.max_attempts == 0 {
            return Err(MqttClientError::InvalidConfiguration {
                field: "max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.inflight_capacity == 0 {
            return Err(MqttClientError::InvalidConfiguration {
                field: "inflight_capacity".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.response_timeout_ms == 0 {
            return Err(MqttClientError::InvalidConfiguration {
                field: "response_timeout_ms".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct EngineSettingsBuilder {
    settings: EngineSettings,
}

impl EngineSettingsBuilder {
    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.settings.retry_delay_ms = ms;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.settings.max_attempts = attempts;
        self
    }

    pub fn inflight_capacity(mut self, capacity: usize) -> Self {
        self.settings.inflight_capacity = capacity;
        self
    }

    pub fn response_timeout_ms(mut self, ms: u64) -> Self {
        self.settings.response_timeout_ms = ms;
        self
    }

    pub fn build(self) -> Result<EngineSettings, MqttClientError> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}
