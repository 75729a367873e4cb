use std::time::Duration;

use serde::Deserialize;

use crate::broker::message::ConnectionType;

/// Top-level configuration settings for the application.
///
/// Includes settings for the HTTP server, the broker, the connector used by
/// the `client` subcommand, and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub connector: ConnectorSettings,
    pub logging: LoggingSettings,
}

/// Where the HTTP server binds and the path it serves Bayeux on.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// How client IDs are minted at handshake.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientIdStrategy {
    #[default]
    Sequential,
    Random,
}

/// Configuration settings for the broker.
///
/// Controls how long a connect is held, the reconnect interval advertised to
/// each transport, and when idle clients are expired.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub poll_timeout_secs: u64,
    pub long_polling_interval_ms: u64,
    pub callback_polling_interval_ms: u64,
    pub client_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub client_ids: ClientIdStrategy,
}

impl BrokerSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn interval_for(&self, connection_type: ConnectionType) -> u64 {
        match connection_type {
            ConnectionType::LongPolling => self.long_polling_interval_ms,
            ConnectionType::CallbackPolling => self.callback_polling_interval_ms,
        }
    }
}

/// Configuration settings for the client-side connector.
///
/// The backoff applies to consecutive transport failures: the n-th failure
/// waits `min(max, initial * factor^(n-1))`.
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectorSettings {
    pub url: String,
    pub connection_type: ConnectionType,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_factor: f64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub connector: Option<PartialConnectorSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub poll_timeout_secs: Option<u64>,
    pub long_polling_interval_ms: Option<u64>,
    pub callback_polling_interval_ms: Option<u64>,
    pub client_timeout_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub client_ids: Option<ClientIdStrategy>,
}

#[derive(Debug, Deserialize)]
pub struct PartialConnectorSettings {
    pub url: Option<String>,
    pub connection_type: Option<ConnectionType>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            path: "/cometd".to_string(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            poll_timeout_secs: 30,
            long_polling_interval_ms: 5000,
            callback_polling_interval_ms: 1000,
            client_timeout_secs: 120,
            sweep_interval_secs: 30,
            client_ids: ClientIdStrategy::Sequential,
        }
    }
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/cometd".to_string(),
            connection_type: ConnectionType::LongPolling,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_factor: 2.0,
            request_timeout_secs: 60,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            broker: BrokerSettings::default(),
            connector: ConnectorSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}
