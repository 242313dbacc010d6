use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

pub const DEFAULT_KEEPALIVE_SECS: u16 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u32 = 30_000;
pub const DEFAULT_RECONNECT_PERIOD_MS: u32 = 1_000;
pub const DEFAULT_CLIENT_ID_TEMPLATE: &str = "brokerdeck_{uuid}";

/// Transport used to reach a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Mqtt,
    Mqtts,
    Ws,
    Wss,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Mqtt => "mqtt",
            Protocol::Mqtts => "mqtts",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Protocol::Ws | Protocol::Wss)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Ok(Protocol::Mqtt),
            "mqtts" => Ok(Protocol::Mqtts),
            "ws" => Ok(Protocol::Ws),
            "wss" => Ok(Protocol::Wss),
            other => Err(BrokerError::validation(format!(
                "Unsupported protocol '{}': expected one of mqtt, mqtts, ws, wss",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub const ALL: [ConnectionStatus; 4] = [
        ConnectionStatus::Disconnected,
        ConnectionStatus::Connecting,
        ConnectionStatus::Connected,
        ConnectionStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        ConnectionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| BrokerError::validation(format!("Unknown connection status '{}'", s)))
    }
}

/// A password or other credential. Never printed, never serialized back out.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// One way of reaching a broker. Used for the primary endpoint of a
/// configuration as well as for each of its fallbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    /// Websocket path, e.g. `/mqtt`. Ignored for plain TCP transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl BrokerEndpoint {
    pub fn url(&self) -> String {
        if self.protocol.is_websocket() {
            let path = self.path.as_deref().unwrap_or("/mqtt");
            let path = path.trim_start_matches('/');
            format!("{}://{}:{}/{}", self.protocol, self.host, self.port, path)
        } else {
            format!("{}://{}:{}", self.protocol, self.host, self.port)
        }
    }

    fn validate(&self, label: &str) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(BrokerError::validation(format!("{} host must not be empty", label)));
        }
        if self.port == 0 {
            return Err(BrokerError::validation(format!(
                "{} port must be between 1 and 65535",
                label
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub id: i64,
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    #[serde(skip_serializing, default)]
    pub password: Option<Secret>,
    /// Client id template; `{uuid}` and `{timestamp}` are expanded per connection.
    pub client_id: String,
    pub qos: u8,
    pub clean_session: bool,
    pub keepalive: u16,
    pub connect_timeout: u32,
    pub reconnect_period: u32,
    pub retain: bool,
    pub fallback_brokers: Vec<BrokerEndpoint>,
    pub is_active: bool,
    pub is_enabled: bool,
    pub connection_status: ConnectionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_connected: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl BrokerConfig {
    pub fn primary_endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint {
            host: self.host.clone(),
            port: self.port,
            protocol: self.protocol,
            path: None,
        }
    }

    /// Primary endpoint followed by the fallbacks, in the order they are tried.
    pub fn endpoints(&self) -> Vec<BrokerEndpoint> {
        let mut endpoints = Vec::with_capacity(1 + self.fallback_brokers.len());
        endpoints.push(self.primary_endpoint());
        endpoints.extend(self.fallback_brokers.iter().cloned());
        endpoints
    }

    pub fn url(&self) -> String {
        self.primary_endpoint().url()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BrokerError::validation("Name must not be empty"));
        }
        self.primary_endpoint().validate("Broker")?;
        if self.qos > 2 {
            return Err(BrokerError::validation(format!(
                "QoS must be 0, 1 or 2 (got {})",
                self.qos
            )));
        }
        if self.client_id.trim().is_empty() {
            return Err(BrokerError::validation("Client id must not be empty"));
        }
        for (i, fallback) in self.fallback_brokers.iter().enumerate() {
            fallback.validate(&format!("Fallback broker #{}", i + 1))?;
        }
        Ok(())
    }
}

/// Payload for creating a configuration. Host and port are optional at the
/// type level so their absence is reported as a validation error with a
/// readable message rather than a decoding failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewBrokerConfig {
    pub id: Option<i64>,
    pub name: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    pub host: Option<String>,
    pub port: Option<i64>,
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub client_id: Option<String>,
    pub qos: Option<i64>,
    pub clean_session: Option<bool>,
    pub keepalive: Option<u16>,
    pub connect_timeout: Option<u32>,
    pub reconnect_period: Option<u32>,
    pub retain: Option<bool>,
    #[serde(default)]
    pub fallback_brokers: Vec<BrokerEndpoint>,
}

impl NewBrokerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(i64::from(port)),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(Secret::new(password));
        self
    }

    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = Some(i64::from(qos));
        self
    }

    /// Builds a validated configuration carrying the given id. Flags start
    /// cleared and the status starts `disconnected`.
    pub fn into_config(self, id: i64, now: OffsetDateTime) -> Result<BrokerConfig> {
        let host = match self.host {
            Some(host) if !host.trim().is_empty() => host.trim().to_string(),
            _ => return Err(BrokerError::validation("Host is required")),
        };
        let port = match self.port {
            Some(port) => checked_port(port)?,
            None => return Err(BrokerError::validation("Port is required")),
        };
        let qos = checked_qos(self.qos.unwrap_or(0))?;
        let name = self
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("{}:{}", host, port));

        let config = BrokerConfig {
            id,
            name,
            protocol: self.protocol,
            host,
            port,
            username: self.username.filter(|u| !u.is_empty()),
            password: self.password.filter(|p| !p.expose().is_empty()),
            client_id: self
                .client_id
                .unwrap_or_else(|| DEFAULT_CLIENT_ID_TEMPLATE.to_string()),
            qos,
            clean_session: self.clean_session.unwrap_or(true),
            keepalive: self.keepalive.unwrap_or(DEFAULT_KEEPALIVE_SECS),
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            reconnect_period: self.reconnect_period.unwrap_or(DEFAULT_RECONNECT_PERIOD_MS),
            retain: self.retain.unwrap_or(false),
            fallback_brokers: self.fallback_brokers,
            is_active: false,
            is_enabled: false,
            connection_status: ConnectionStatus::Disconnected,
            last_connected: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Partial update. Omitted fields are left untouched; an empty string for
/// `username` or `password` clears the credential. Flags and connection state
/// are not editable here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfigPatch {
    pub name: Option<String>,
    pub protocol: Option<Protocol>,
    pub host: Option<String>,
    pub port: Option<i64>,
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub client_id: Option<String>,
    pub qos: Option<i64>,
    pub clean_session: Option<bool>,
    pub keepalive: Option<u16>,
    pub connect_timeout: Option<u32>,
    pub reconnect_period: Option<u32>,
    pub retain: Option<bool>,
    pub fallback_brokers: Option<Vec<BrokerEndpoint>>,
}

impl BrokerConfigPatch {
    pub fn apply_to(self, config: &mut BrokerConfig) -> Result<()> {
        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(protocol) = self.protocol {
            config.protocol = protocol;
        }
        if let Some(host) = self.host {
            config.host = host.trim().to_string();
        }
        if let Some(port) = self.port {
            config.port = checked_port(port)?;
        }
        if let Some(username) = self.username {
            config.username = Some(username).filter(|u| !u.is_empty());
        }
        if let Some(password) = self.password {
            config.password = Some(password).filter(|p| !p.expose().is_empty());
        }
        if let Some(client_id) = self.client_id {
            config.client_id = client_id;
        }
        if let Some(qos) = self.qos {
            config.qos = checked_qos(qos)?;
        }
        if let Some(clean_session) = self.clean_session {
            config.clean_session = clean_session;
        }
        if let Some(keepalive) = self.keepalive {
            config.keepalive = keepalive;
        }
        if let Some(connect_timeout) = self.connect_timeout {
            config.connect_timeout = connect_timeout;
        }
        if let Some(reconnect_period) = self.reconnect_period {
            config.reconnect_period = reconnect_period;
        }
        if let Some(retain) = self.retain {
            config.retain = retain;
        }
        if let Some(fallback_brokers) = self.fallback_brokers {
            config.fallback_brokers = fallback_brokers;
        }
        config.validate()
    }
}

fn checked_port(port: i64) -> Result<u16> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| {
            BrokerError::validation(format!("Port must be between 1 and 65535 (got {})", port))
        })
}

fn checked_qos(qos: i64) -> Result<u8> {
    match qos {
        0..=2 => Ok(qos as u8),
        _ => Err(BrokerError::validation(format!(
            "QoS must be 0, 1 or 2 (got {})",
            qos
        ))),
    }
}

/// Expands a client id template for one connection attempt.
pub fn render_client_id(template: &str) -> String {
    let mut id = template.to_string();
    if id.contains("{uuid}") {
        let uuid = Uuid::new_v4().simple().to_string();
        id = id.replace("{uuid}", &uuid[..8]);
    }
    if id.contains("{timestamp}") {
        let ts = OffsetDateTime::now_utc().unix_timestamp().to_string();
        id = id.replace("{timestamp}", &ts);
    }
    id
}
