//! Configuration management for bridge connectors.
//!
//! Connection settings are shared by both directions and embedded in the
//! source- and sink-specific settings:
//!
//! ```toml
//! connection_name = "orders-bridge"
//! destination = "topic:orders"
//! max_reconnect_attempts = 20
//! prefetch_count = 50
//!
//! [service]
//! service_url = "https://messaging.example.com"
//! client_id = "sb-clone"
//! client_secret = "..."
//! token_endpoint = "https://auth.example.com/oauth/token"
//! xsappname = "orders"
//!
//! [processing]
//! log_level = "info"
//! ```

use crate::broker::{ConsumerOptions, ExchangeBinding, ProducerOptions};
use crate::destination::Destination;
use crate::{BridgeError, BridgeResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::time::Duration;

/// Settings for reaching the broker, shared by sources and sinks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Identifies the connection in logs and metrics
    pub connection_name: String,

    /// Destination name, optionally prefixed with `queue:` or `topic:`
    #[serde(alias = "queue_name")]
    pub destination: String,

    /// Messaging service endpoint and credentials
    pub service: ServiceSettings,

    /// Maximum reconnect attempts of the transport, -1 for unlimited
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: i32,

    /// Delay before reconnecting after the first failure
    #[serde(default = "default_initial_reconnect_delay_ms")]
    pub initial_reconnect_delay_ms: u64,

    /// Delay between subsequent reconnect attempts
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_max_reconnect_attempts() -> i32 {
    20
}

fn default_initial_reconnect_delay_ms() -> u64 {
    3000
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

impl ConnectionSettings {
    /// Create settings for a connection name and destination with default service settings
    pub fn new(connection_name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
            destination: destination.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `EM_CONNECTION_NAME`: Required, connection name
    /// - `EM_DESTINATION` (or `EM_QUEUE_NAME`): Required, destination name
    /// - `EM_SERVICE_URL`: Required, messaging service URL
    /// - `EM_CLIENT_ID`, `EM_CLIENT_SECRET`, `EM_TOKEN_ENDPOINT`: OAuth2 client credentials
    /// - `EM_XSAPPNAME`: Application name of the service binding
    /// - `EM_PROTOCOL`: Messaging protocol (default: amqp10ws)
    /// - `EM_MAX_RECONNECT_ATTEMPTS`: Reconnect attempts, -1 for unlimited (default: 20)
    /// - `EM_INITIAL_RECONNECT_DELAY_MS`: First reconnect delay (default: 3000)
    /// - `EM_RECONNECT_DELAY_MS`: Subsequent reconnect delay (default: 5000)
    pub fn from_env() -> BridgeResult<Self> {
        let connection_name = env::var("EM_CONNECTION_NAME")
            .map_err(|_| BridgeError::config("EM_CONNECTION_NAME is required"))?;

        let destination = env::var("EM_DESTINATION")
            .or_else(|_| env::var("EM_QUEUE_NAME"))
            .map_err(|_| BridgeError::config("EM_DESTINATION is required"))?;

        let service_url = env::var("EM_SERVICE_URL")
            .map_err(|_| BridgeError::config("EM_SERVICE_URL is required"))?;

        let service = ServiceSettings {
            service_url,
            client_id: env::var("EM_CLIENT_ID").ok(),
            client_secret: env::var("EM_CLIENT_SECRET").ok(),
            token_endpoint: env::var("EM_TOKEN_ENDPOINT").ok(),
            xsappname: env::var("EM_XSAPPNAME").ok(),
            protocol: env::var("EM_PROTOCOL").unwrap_or_else(|_| default_protocol()),
        };

        let max_reconnect_attempts = env::var("EM_MAX_RECONNECT_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(default_max_reconnect_attempts);

        let initial_reconnect_delay_ms = env::var("EM_INITIAL_RECONNECT_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(default_initial_reconnect_delay_ms);

        let reconnect_delay_ms = env::var("EM_RECONNECT_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(default_reconnect_delay_ms);

        Ok(Self {
            connection_name,
            destination,
            service,
            max_reconnect_attempts,
            initial_reconnect_delay_ms,
            reconnect_delay_ms,
        })
    }

    /// Apply environment variable overrides after loading from a file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("EM_CONNECTION_NAME") {
            self.connection_name = val;
        }
        if let Ok(val) = env::var("EM_DESTINATION").or_else(|_| env::var("EM_QUEUE_NAME")) {
            self.destination = val;
        }
        if let Ok(val) = env::var("EM_SERVICE_URL") {
            self.service.service_url = val;
        }
        if let Ok(val) = env::var("EM_CLIENT_ID") {
            self.service.client_id = Some(val);
        }
        if let Ok(val) = env::var("EM_CLIENT_SECRET") {
            self.service.client_secret = Some(val);
        }
        if let Ok(val) = env::var("EM_TOKEN_ENDPOINT") {
            self.service.token_endpoint = Some(val);
        }
        if let Ok(val) = env::var("EM_XSAPPNAME") {
            self.service.xsappname = Some(val);
        }
        if let Ok(val) = env::var("EM_PROTOCOL") {
            self.service.protocol = val;
        }
        if let Ok(val) = env::var("EM_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                self.max_reconnect_attempts = n;
            }
        }
        if let Ok(val) = env::var("EM_INITIAL_RECONNECT_DELAY_MS") {
            if let Ok(n) = val.parse() {
                self.initial_reconnect_delay_ms = n;
            }
        }
        if let Ok(val) = env::var("EM_RECONNECT_DELAY_MS") {
            if let Ok(n) = val.parse() {
                self.reconnect_delay_ms = n;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> BridgeResult<()> {
        if self.connection_name.is_empty() {
            return Err(BridgeError::config("connection_name cannot be empty"));
        }

        if self.destination.is_empty() {
            return Err(BridgeError::config("destination cannot be empty"));
        }

        if Destination::resolve(&self.destination).name().is_empty() {
            return Err(BridgeError::config(format!(
                "destination '{}' has an empty name",
                self.destination
            )));
        }

        if self.max_reconnect_attempts < -1 {
            return Err(BridgeError::config(
                "max_reconnect_attempts must be -1 (unlimited) or >= 0",
            ));
        }

        self.service.validate()
    }

    /// The resolved destination
    pub fn resolved_destination(&self) -> Destination {
        Destination::resolve(&self.destination)
    }

    /// `true` when the transport should retry forever
    pub fn unlimited_reconnects(&self) -> bool {
        self.max_reconnect_attempts < 0
    }

    pub fn initial_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.initial_reconnect_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connection_name: "embridge".to_string(),
            destination: "queue:destination".to_string(),
            service: ServiceSettings::default(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            initial_reconnect_delay_ms: default_initial_reconnect_delay_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl fmt::Display for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]({})",
            self.connection_name,
            self.resolved_destination()
        )
    }
}

/// Messaging service endpoint and OAuth2 client credentials
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub service_url: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub xsappname: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "amqp10ws".to_string()
}

impl ServiceSettings {
    pub fn validate(&self) -> BridgeResult<()> {
        if self.service_url.is_empty() {
            return Err(BridgeError::config("service_url cannot be empty"));
        }

        if self.protocol.is_empty() {
            return Err(BridgeError::config("protocol cannot be empty"));
        }

        let credentials = [
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("token_endpoint", &self.token_endpoint),
        ];
        let provided = credentials.iter().filter(|(_, v)| v.is_some()).count();
        if provided > 0 && provided < credentials.len() {
            let missing: Vec<&str> = credentials
                .iter()
                .filter(|(_, v)| v.is_none())
                .map(|(name, _)| *name)
                .collect();
            return Err(BridgeError::config(format!(
                "incomplete OAuth2 credentials, missing: {}",
                missing.join(", ")
            )));
        }

        Ok(())
    }

    /// Check if OAuth2 client credentials are configured
    pub fn has_credentials(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some() && self.token_endpoint.is_some()
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            service_url: "https://localhost/protocols/amqp10ws".to_string(),
            client_id: None,
            client_secret: None,
            token_endpoint: None,
            xsappname: None,
            protocol: default_protocol(),
        }
    }
}

impl fmt::Debug for ServiceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceSettings")
            .field("service_url", &self.service_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("token_endpoint", &self.token_endpoint)
            .field("xsappname", &self.xsappname)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Runtime behaviour shared by both connector directions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingSettings {
    /// Log level used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Rebuild the connection after a fatal acknowledge/rollback failure instead of stopping
    #[serde(default)]
    pub reconnect_on_fatal: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            reconnect_on_fatal: false,
        }
    }
}

impl ProcessingSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("LOG_LEVEL") {
            self.log_level = val;
        }
        if let Ok(val) = env::var("EM_RECONNECT_ON_FATAL") {
            if let Ok(b) = val.parse() {
                self.reconnect_on_fatal = b;
            }
        }
    }
}

/// Settings for a source connector (broker -> pipeline)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    #[serde(flatten)]
    pub connection: ConnectionSettings,

    /// Maximum number of messages delivered ahead of acknowledgement, 0 for unlimited
    #[serde(default)]
    pub prefetch_count: u32,

    /// Apply the prefetch limit to the whole session rather than the consumer
    #[serde(default)]
    pub prefetch_global: bool,

    #[serde(default)]
    pub processing: ProcessingSettings,
}

impl SourceSettings {
    pub fn new(connection: ConnectionSettings) -> Self {
        Self {
            connection,
            prefetch_count: 0,
            prefetch_global: false,
            processing: ProcessingSettings::default(),
        }
    }

    /// Load from `CONFIG_FILE` when set, otherwise from the environment, then apply overrides
    pub fn load() -> BridgeResult<Self> {
        let mut settings = if let Ok(path) = env::var("CONFIG_FILE") {
            Self::from_file(&path)?
        } else {
            Self::from_env()?
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Load configuration from environment variables
    ///
    /// In addition to the connection variables:
    /// - `EM_PREFETCH_COUNT`: Prefetch limit (default: 0, unlimited)
    /// - `EM_PREFETCH_GLOBAL`: Session-wide prefetch (default: false)
    pub fn from_env() -> BridgeResult<Self> {
        let mut settings = Self::new(ConnectionSettings::from_env()?);
        settings.prefetch_count = env::var("EM_PREFETCH_COUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        settings.prefetch_global = env::var("EM_PREFETCH_GLOBAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(false);
        Ok(settings)
    }

    pub fn from_file(path: &str) -> BridgeResult<Self> {
        read_toml(path)
    }

    /// Load from a generic key/value mapping
    pub fn from_map(map: serde_json::Value) -> BridgeResult<Self> {
        from_value(map)
    }

    pub fn apply_env_overrides(&mut self) {
        self.connection.apply_env_overrides();
        self.processing.apply_env_overrides();
        if let Ok(val) = env::var("EM_PREFETCH_COUNT") {
            if let Ok(n) = val.parse() {
                self.prefetch_count = n;
            }
        }
        if let Ok(val) = env::var("EM_PREFETCH_GLOBAL") {
            if let Ok(b) = val.parse() {
                self.prefetch_global = b;
            }
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        self.connection.validate()
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            prefetch_count: self.prefetch_count,
            prefetch_global: self.prefetch_global,
        }
    }
}

/// Settings for a sink connector (pipeline -> broker)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkSettings {
    #[serde(flatten)]
    pub connection: ConnectionSettings,

    /// Exchange to publish on, for brokers with exchange bindings
    #[serde(default)]
    pub exchange_name: Option<String>,

    /// Routing key used with the exchange
    #[serde(default)]
    pub routing_key: Option<String>,

    #[serde(default = "default_exchange_type")]
    pub exchange_type: String,

    /// How long `close()` waits for outstanding send completions
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    #[serde(default)]
    pub processing: ProcessingSettings,
}

fn default_exchange_type() -> String {
    "topic".to_string()
}

fn default_close_timeout_ms() -> u64 {
    5000
}

impl SinkSettings {
    pub fn new(connection: ConnectionSettings) -> Self {
        Self {
            connection,
            exchange_name: None,
            routing_key: None,
            exchange_type: default_exchange_type(),
            close_timeout_ms: default_close_timeout_ms(),
            processing: ProcessingSettings::default(),
        }
    }

    /// Load from `CONFIG_FILE` when set, otherwise from the environment, then apply overrides
    pub fn load() -> BridgeResult<Self> {
        let mut settings = if let Ok(path) = env::var("CONFIG_FILE") {
            Self::from_file(&path)?
        } else {
            Self::from_env()?
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Load configuration from environment variables
    ///
    /// In addition to the connection variables:
    /// - `EM_EXCHANGE_NAME`, `EM_ROUTING_KEY`, `EM_EXCHANGE_TYPE`: exchange routing
    /// - `EM_CLOSE_TIMEOUT_MS`: completion drain timeout on close (default: 5000)
    pub fn from_env() -> BridgeResult<Self> {
        let mut settings = Self::new(ConnectionSettings::from_env()?);
        settings.exchange_name = env::var("EM_EXCHANGE_NAME").ok();
        settings.routing_key = env::var("EM_ROUTING_KEY").ok();
        if let Ok(val) = env::var("EM_EXCHANGE_TYPE") {
            settings.exchange_type = val;
        }
        settings.close_timeout_ms = env::var("EM_CLOSE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(default_close_timeout_ms);
        Ok(settings)
    }

    pub fn from_file(path: &str) -> BridgeResult<Self> {
        read_toml(path)
    }

    /// Load from a generic key/value mapping
    pub fn from_map(map: serde_json::Value) -> BridgeResult<Self> {
        from_value(map)
    }

    pub fn apply_env_overrides(&mut self) {
        self.connection.apply_env_overrides();
        self.processing.apply_env_overrides();
        if let Ok(val) = env::var("EM_EXCHANGE_NAME") {
            self.exchange_name = Some(val);
        }
        if let Ok(val) = env::var("EM_ROUTING_KEY") {
            self.routing_key = Some(val);
        }
        if let Ok(val) = env::var("EM_EXCHANGE_TYPE") {
            self.exchange_type = val;
        }
        if let Ok(val) = env::var("EM_CLOSE_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.close_timeout_ms = n;
            }
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        self.connection.validate()?;

        if self.routing_key.is_some() && self.exchange_name.is_none() {
            return Err(BridgeError::config(
                "routing_key requires exchange_name to be set",
            ));
        }

        if matches!(&self.exchange_name, Some(name) if name.is_empty()) {
            return Err(BridgeError::config("exchange_name cannot be empty"));
        }

        Ok(())
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn producer_options(&self) -> ProducerOptions {
        ProducerOptions {
            exchange: self.exchange_name.as_ref().map(|name| ExchangeBinding {
                name: name.clone(),
                routing_key: self.routing_key.clone(),
                exchange_type: self.exchange_type.clone(),
            }),
        }
    }
}

fn read_toml<T: DeserializeOwned>(path: &str) -> BridgeResult<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        BridgeError::config(format!("Failed to read config file {}: {}", path, e))
    })?;

    toml::from_str(&content)
        .map_err(|e| BridgeError::config(format!("Failed to parse config file {}: {}", path, e)))
}

fn from_value<T: DeserializeOwned>(value: serde_json::Value) -> BridgeResult<T> {
    serde_json::from_value(value)
        .map_err(|e| BridgeError::config(format!("Invalid configuration map: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_connection_defaults() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.max_reconnect_attempts, 20);
        assert_eq!(settings.initial_reconnect_delay(), Duration::from_millis(3000));
        assert_eq!(settings.reconnect_delay(), Duration::from_millis(5000));
        assert_eq!(settings.service.protocol, "amqp10ws");
        assert!(!settings.unlimited_reconnects());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_connection_validation() {
        let mut settings = ConnectionSettings::new("bridge", "orders");
        assert!(settings.validate().is_ok());

        settings.connection_name = String::new();
        assert!(settings.validate().is_err());

        settings.connection_name = "bridge".to_string();
        settings.destination = "topic:".to_string();
        assert!(settings.validate().is_err());

        settings.destination = "orders".to_string();
        settings.max_reconnect_attempts = -2;
        assert!(settings.validate().is_err());

        settings.max_reconnect_attempts = -1;
        assert!(settings.validate().is_ok());
        assert!(settings.unlimited_reconnects());
    }

    #[test]
    fn test_partial_credentials_rejected() {
        let mut settings = ConnectionSettings::new("bridge", "orders");
        settings.service.client_id = Some("client".to_string());
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("client_secret"));
        assert!(err.to_string().contains("token_endpoint"));

        settings.service.client_secret = Some("secret".to_string());
        settings.service.token_endpoint = Some("https://auth/token".to_string());
        assert!(settings.validate().is_ok());
        assert!(settings.service.has_credentials());
    }

    #[test]
    fn test_display_and_debug() {
        let mut settings = ConnectionSettings::new("orders-bridge", "orders");
        assert_eq!(settings.to_string(), "[orders-bridge](queue:orders)");

        settings.service.client_secret = Some("hunter2".to_string());
        let debug = format!("{:?}", settings);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn test_source_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
connection_name = "orders-source"
destination = "topic:orders"
prefetch_count = 50
prefetch_global = true

[service]
service_url = "https://messaging.example.com"

[processing]
log_level = "debug"
"#
        )
        .unwrap();

        let settings = SourceSettings::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(settings.connection.connection_name, "orders-source");
        assert_eq!(
            settings.connection.resolved_destination(),
            Destination::Topic("orders".to_string())
        );
        assert_eq!(settings.connection.max_reconnect_attempts, 20);
        assert_eq!(
            settings.consumer_options(),
            ConsumerOptions {
                prefetch_count: 50,
                prefetch_global: true,
            }
        );
        assert_eq!(settings.processing.log_level, "debug");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_sink_from_map() {
        let settings = SinkSettings::from_map(serde_json::json!({
            "connection_name": "orders-sink",
            "queue_name": "orders",
            "exchange_name": "events",
            "routing_key": "orders.created",
            "reconnect_delay_ms": 100,
            "service": { "service_url": "https://messaging.example.com" },
        }))
        .unwrap();

        assert_eq!(settings.connection.destination, "orders");
        assert_eq!(settings.connection.reconnect_delay_ms, 100);
        assert_eq!(settings.exchange_type, "topic");
        assert_eq!(settings.close_timeout(), Duration::from_millis(5000));

        let exchange = settings.producer_options().exchange.unwrap();
        assert_eq!(exchange.name, "events");
        assert_eq!(exchange.routing_key.as_deref(), Some("orders.created"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_service_section_required() {
        let err = SinkSettings::from_map(serde_json::json!({
            "connection_name": "orders-sink",
            "destination": "orders",
        }))
        .unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(_)));

        let err = SourceSettings::from_map(serde_json::json!({
            "connection_name": "orders-source",
            "destination": "orders",
            "service": { "protocol": "amqp10ws" },
        }))
        .unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(_)));
    }

    #[test]
    fn test_env_overrides_cover_file_settings() {
        let vars = [
            ("EM_QUEUE_NAME", "queue:overridden"),
            ("EM_INITIAL_RECONNECT_DELAY_MS", "250"),
            ("EM_XSAPPNAME", "bridge-app"),
            ("EM_PROTOCOL", "amqp10"),
            ("EM_PREFETCH_GLOBAL", "true"),
            ("EM_EXCHANGE_NAME", "events"),
            ("EM_ROUTING_KEY", "orders.updated"),
            ("EM_EXCHANGE_TYPE", "direct"),
        ];
        for (key, value) in vars {
            env::set_var(key, value);
        }

        let mut source = SourceSettings::new(ConnectionSettings::new("source", "orders"));
        source.apply_env_overrides();
        let mut sink = SinkSettings::new(ConnectionSettings::new("sink", "orders"));
        sink.apply_env_overrides();

        for (key, _) in vars {
            env::remove_var(key);
        }

        assert_eq!(source.connection.destination, "queue:overridden");
        assert_eq!(source.connection.initial_reconnect_delay_ms, 250);
        assert_eq!(source.connection.service.xsappname.as_deref(), Some("bridge-app"));
        assert_eq!(source.connection.service.protocol, "amqp10");
        assert!(source.prefetch_global);

        let exchange = sink.producer_options().exchange.unwrap();
        assert_eq!(exchange.name, "events");
        assert_eq!(exchange.routing_key.as_deref(), Some("orders.updated"));
        assert_eq!(exchange.exchange_type, "direct");
    }

    #[test]
    fn test_sink_validation() {
        let mut settings = SinkSettings::new(ConnectionSettings::new("sink", "orders"));
        assert!(settings.validate().is_ok());
        assert!(settings.producer_options().exchange.is_none());

        settings.routing_key = Some("key".to_string());
        assert!(settings.validate().is_err());

        settings.exchange_name = Some(String::new());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_invalid_file() {
        let err = SourceSettings::from_file("/nonexistent/embridge.toml").unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(_)));
    }
}
