//! CLI for the Bayeux bus
//!
//! Subcommands:
//! - `server`: run the HTTP server
//! - `client`: join a channel, say something and print what arrives

use std::time::Duration;

use bayeux::broker::message::ConnectionType;
use bayeux::broker::{self, Broker};
use bayeux::config::{ConnectorSettings, Settings, load_config};
use bayeux::connector::{Connector, HttpTransport};
use bayeux::transport::start_http_server;
use bayeux::utils::logging;
use clap::{Parser, ValueEnum};
use serde_json::json;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "bayeux")]
enum Command {
    /// Start the HTTP server
    Server,
    /// Run a chat client against a running server
    Client {
        /// Endpoint to connect to (defaults to the configured connector url)
        #[arg(long)]
        url: Option<String>,
        #[arg(long, default_value = "/chat/demo")]
        channel: String,
        #[arg(long, default_value = "guest")]
        user: String,
        /// Line to publish once joined
        #[arg(long)]
        text: Option<String>,
        #[arg(long, value_enum)]
        transport: Option<TransportArg>,
        /// Seconds to listen before disconnecting
        #[arg(long, default_value_t = 5)]
        listen: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportArg {
    LongPolling,
    CallbackPolling,
}

impl From<TransportArg> for ConnectionType {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::LongPolling => ConnectionType::LongPolling,
            TransportArg::CallbackPolling => ConnectionType::CallbackPolling,
        }
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let cmd = Command::parse();
    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            return;
        }
    };
    logging::init(&settings.logging.level);

    match cmd {
        Command::Server => {
            if let Err(e) = run_server(settings).await {
                error!("Server failed: {}", e);
            }
        }
        Command::Client {
            url,
            channel,
            user,
            text,
            transport,
            listen,
        } => {
            let mut connector_settings = settings.connector;
            if let Some(url) = url {
                connector_settings.url = url;
            }
            if let Some(transport) = transport {
                connector_settings.connection_type = transport.into();
            }
            let chat = Chat {
                channel,
                user,
                text,
                listen: Duration::from_secs(listen),
            };
            if let Err(e) = run_client(&connector_settings, chat).await {
                error!("Client failed: {}", e);
            }
        }
    }
}

async fn run_server(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let broker = broker::shared(Broker::new(settings.broker.clone()));

    tokio::spawn(Broker::start_sweep_loop(broker.clone()));

    tokio::select! {
        result = start_http_server(&settings.server, broker) => {
            result?;
            error!("HTTP server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    Ok(())
}

struct Chat {
    channel: String,
    user: String,
    text: Option<String>,
    listen: Duration,
}

async fn run_client(
    settings: &ConnectorSettings,
    chat: Chat,
) -> Result<(), Box<dyn std::error::Error>> {
    let transport = HttpTransport::from_settings(settings)?;
    let connector = Connector::new(transport, settings);
    connector.connect();

    // subscribe and announce ourselves in a single exchange
    connector.start_batch();
    connector
        .subscribe(&chat.channel, |message| {
            if let Some(data) = &message.data {
                println!("{} {}", message.channel, data);
            }
        })
        .await;
    connector
        .publish(&chat.channel, json!({ "user": chat.user, "joined": true }))
        .await;
    connector.end_batch().await;

    if let Some(text) = chat.text {
        connector
            .publish(&chat.channel, json!({ "user": chat.user, "chat": text }))
            .await;
    }

    tokio::select! {
        _ = tokio::time::sleep(chat.listen) => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    connector.disconnect().await;
    info!(errors = connector.error_count(), "client finished");
    Ok(())
}
