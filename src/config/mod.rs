mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, ClientIdStrategy, ConnectorSettings, LoggingSettings, ServerSettings,
    Settings,
};

/// Prefix of the environment variables read by [`load_config`], e.g.
/// `BAYEUX__BROKER__POLL_TIMEOUT_SECS=10`.
pub const ENV_PREFIX: &str = "BAYEUX";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct containing every section
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .prefix_separator("__")
                .separator("__"),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let server = partial.server;
    let broker = partial.broker;
    let connector = partial.connector;
    let logging = partial.logging;

    Settings {
        server: ServerSettings {
            host: server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
            path: server
                .as_ref()
                .and_then(|s| s.path.clone())
                .unwrap_or(default.server.path),
        },
        broker: BrokerSettings {
            poll_timeout_secs: broker
                .as_ref()
                .and_then(|b| b.poll_timeout_secs)
                .unwrap_or(default.broker.poll_timeout_secs),
            long_polling_interval_ms: broker
                .as_ref()
                .and_then(|b| b.long_polling_interval_ms)
                .unwrap_or(default.broker.long_polling_interval_ms),
            callback_polling_interval_ms: broker
                .as_ref()
                .and_then(|b| b.callback_polling_interval_ms)
                .unwrap_or(default.broker.callback_polling_interval_ms),
            client_timeout_secs: broker
                .as_ref()
                .and_then(|b| b.client_timeout_secs)
                .unwrap_or(default.broker.client_timeout_secs),
            sweep_interval_secs: broker
                .as_ref()
                .and_then(|b| b.sweep_interval_secs)
                .unwrap_or(default.broker.sweep_interval_secs),
            client_ids: broker
                .as_ref()
                .and_then(|b| b.client_ids)
                .unwrap_or(default.broker.client_ids),
        },
        connector: ConnectorSettings {
            url: connector
                .as_ref()
                .and_then(|c| c.url.clone())
                .unwrap_or(default.connector.url),
            connection_type: connector
                .as_ref()
                .and_then(|c| c.connection_type)
                .unwrap_or(default.connector.connection_type),
            initial_backoff_ms: connector
                .as_ref()
                .and_then(|c| c.initial_backoff_ms)
                .unwrap_or(default.connector.initial_backoff_ms),
            max_backoff_ms: connector
                .as_ref()
                .and_then(|c| c.max_backoff_ms)
                .unwrap_or(default.connector.max_backoff_ms),
            backoff_factor: connector
                .as_ref()
                .and_then(|c| c.backoff_factor)
                .unwrap_or(default.connector.backoff_factor),
            request_timeout_secs: connector
                .as_ref()
                .and_then(|c| c.request_timeout_secs)
                .unwrap_or(default.connector.request_timeout_secs),
        },
        logging: LoggingSettings {
            level: logging
                .and_then(|l| l.level)
                .unwrap_or(default.logging.level),
        },
    }
}
