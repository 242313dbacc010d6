use crate::models::{BrokerConfig, NewBrokerConfig, Protocol};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub probe_timeout_ms: u64,

    pub mqtt_retry_interval_ms: u64,
    pub mqtt_max_retries: i32,
    pub status_topic: String,

    /// Optional broker from the environment, used while nothing is enabled.
    pub mqtt_host: Option<String>,
    pub mqtt_port: u16,
    pub mqtt_protocol: Protocol,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_client_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;
        const MAX_PROBE_TIMEOUT: u64 = 60_000;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_retry_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RETRY_INTERVAL_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }
        if !(MIN_TIMEOUT..=MAX_PROBE_TIMEOUT).contains(&self.probe_timeout_ms) {
            return Err(ConfigError::ParsingError(format!(
                "PROBE_TIMEOUT_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_PROBE_TIMEOUT
            )));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parse_u64 = |key: &str, default: u64| -> Result<u64, ConfigError> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ConfigError::ParsingError(format!("{} must be a valid number", key))),
                None => Ok(default),
            }
        };

        let config = Self {
            db_path: lookup("BROKERDECK_DB_PATH").unwrap_or_else(|| "brokerdeck.db".to_string()),
            probe_timeout_ms: parse_u64("PROBE_TIMEOUT_MS", 10_000)?,

            mqtt_retry_interval_ms: parse_u64("MQTT_RETRY_INTERVAL_MS", 5000)?,
            mqtt_max_retries: lookup("MQTT_MAX_RETRIES")
                .unwrap_or_else(|| "-1".to_string())
                .trim()
                .parse::<i32>()
                .map_err(|_| ConfigError::ParsingError("MQTT_MAX_RETRIES must be an integer".to_string()))?,
            status_topic: lookup("MQTT_STATUS_TOPIC").unwrap_or_else(|| "brokerdeck/status".to_string()),

            mqtt_host: lookup("MQTT_HOST").filter(|h| !h.trim().is_empty()),
            mqtt_port: match lookup("MQTT_PORT") {
                Some(raw) => raw
                    .trim()
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| ConfigError::MissingOrInvalid("MQTT_PORT".to_string()))?,
                None => 1883,
            },
            mqtt_protocol: match lookup("MQTT_PROTOCOL") {
                Some(raw) => raw
                    .parse()
                    .map_err(|e| ConfigError::ParsingError(format!("MQTT_PROTOCOL: {}", e)))?,
                None => Protocol::Mqtt,
            },
            mqtt_username: lookup("MQTT_USERNAME").unwrap_or_default(), // Default to empty
            mqtt_password: lookup("MQTT_PASSWORD").unwrap_or_default(), // Default to empty
            mqtt_client_id: lookup("MQTT_CLIENT_ID").filter(|c| !c.is_empty()),
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.mqtt_retry_interval_ms)
    }

    /// The environment broker as a configuration the live session can dial.
    /// It never enters the store, so it carries id 0.
    pub fn env_broker(&self) -> Result<Option<BrokerConfig>, ConfigError> {
        let Some(host) = self.mqtt_host.as_ref() else {
            return Ok(None);
        };
        let mut new = NewBrokerConfig::new(host.clone(), self.mqtt_port)
            .with_name("environment")
            .with_protocol(self.mqtt_protocol);
        if !self.mqtt_username.is_empty() {
            new = new.with_credentials(self.mqtt_username.clone(), self.mqtt_password.clone());
        }
        new.client_id = self.mqtt_client_id.clone();
        new.into_config(0, OffsetDateTime::now_utc())
            .map(Some)
            .map_err(|e| ConfigError::ParsingError(e.to_string()))
    }
}
