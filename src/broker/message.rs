//! Message definitions for the broker
//!
//! `Message` is the canonical wire/internal representation exchanged between
//! a connector and the broker. Every Bayeux field is an explicit optional so
//! that absent keys are omitted from the JSON and the meta-channel action set
//! is matched exhaustively through [`ChannelKind`].
//!
//! Messages are treated as immutable values: a response is always a new
//! message built with [`Message::reply_to`], never an edited request.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};

use crate::utils::ProtocolError;

/// Protocol version advertised in handshake responses.
pub const BAYEUX_VERSION: &str = "1.0";

/// Oldest protocol version a connector announces it can speak.
pub const MINIMUM_VERSION: &str = "0.9";

pub const META_HANDSHAKE: &str = "/meta/handshake";
pub const META_CONNECT: &str = "/meta/connect";
pub const META_SUBSCRIBE: &str = "/meta/subscribe";
pub const META_UNSUBSCRIBE: &str = "/meta/unsubscribe";
pub const META_DISCONNECT: &str = "/meta/disconnect";

/// Broadcast channel carrying session lifecycle events for monitoring
/// subscribers.
pub const LIFECYCLE_CHANNEL: &str = "/cometd/meta";

const META_PREFIX: &str = "/meta/";
const SERVICE_PREFIX: &str = "/service/";

/// Correlates a request with its response. Clients send either a string or
/// a JSON number (negative and fractional included); both are echoed back
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(Number),
    Text(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Number(n) => write!(f, "{n}"),
            MessageId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for MessageId {
    fn from(n: u64) -> Self {
        MessageId::Number(n.into())
    }
}

impl From<i64> for MessageId {
    fn from(n: i64) -> Self {
        MessageId::Number(n.into())
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId::Text(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        MessageId::Text(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    #[serde(rename = "long-polling")]
    LongPolling,
    #[serde(rename = "callback-polling")]
    CallbackPolling,
}

impl ConnectionType {
    pub const ALL: [ConnectionType; 2] =
        [ConnectionType::LongPolling, ConnectionType::CallbackPolling];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "long-polling" => Some(ConnectionType::LongPolling),
            "callback-polling" => Some(ConnectionType::CallbackPolling),
            _ => None,
        }
    }
}

// Peers may advertise transports this crate does not speak (websocket,
// iframe, ...). Those names are dropped rather than failing the message.
fn known_connection_types<'de, D>(
    deserializer: D,
) -> Result<Option<Vec<ConnectionType>>, D::Error>
where
    D: Deserializer<'de>,
{
    let names: Option<Vec<String>> = Option::deserialize(deserializer)?;
    Ok(names.map(|names| {
        names
            .iter()
            .filter_map(|name| ConnectionType::from_name(name))
            .collect()
    }))
}

fn known_connection_type<'de, D>(deserializer: D) -> Result<Option<ConnectionType>, D::Error>
where
    D: Deserializer<'de>,
{
    let name: Option<String> = Option::deserialize(deserializer)?;
    Ok(name.as_deref().and_then(ConnectionType::from_name))
}

/// What a client should do once its current request completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reconnect {
    Retry,
    None,
    Handshake,
}

/// Server-supplied reconnection hint. `interval` and `timeout` are in
/// milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<Reconnect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Advice {
    pub fn retry(interval_ms: u64) -> Self {
        Self {
            reconnect: Some(Reconnect::Retry),
            interval: Some(interval_ms),
            timeout: None,
        }
    }

    pub fn handshake() -> Self {
        Self {
            reconnect: Some(Reconnect::Handshake),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
    #[serde(
        default,
        deserialize_with = "known_connection_types",
        skip_serializing_if = "Option::is_none"
    )]
    pub supported_connection_types: Option<Vec<ConnectionType>>,
    #[serde(
        default,
        deserialize_with = "known_connection_type",
        skip_serializing_if = "Option::is_none"
    )]
    pub connection_type: Option<ConnectionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reestablish: Option<bool>,
    /// Lifecycle event name on [`LIFECYCLE_CHANNEL`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl Message {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }

    /// A payload-carrying message as fanned out to subscribers.
    pub fn broadcast(channel: impl Into<String>, data: Value) -> Self {
        Self::new(channel).with_data(data)
    }

    /// A session lifecycle event (`handshake`, `connect`) for subscribers of
    /// [`LIFECYCLE_CHANNEL`].
    pub fn lifecycle(action: &str) -> Self {
        let mut event = Self::broadcast(LIFECYCLE_CHANNEL, Value::Object(Default::default()))
            .with_successful(true);
        event.action = Some(action.to_string());
        event
    }

    /// Start a response to `request`: same `channel`, `clientId` and `id`,
    /// nothing else.
    pub fn reply_to(request: &Message) -> Self {
        Self {
            channel: request.channel.clone(),
            client_id: request.client_id.clone(),
            id: request.id.clone(),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = Some(subscription.into());
        self
    }

    pub fn with_successful(mut self, successful: bool) -> Self {
        self.successful = Some(successful);
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.successful = Some(false);
        self.error = Some(error.to_string());
        self
    }

    pub fn with_advice(mut self, advice: Advice) -> Self {
        self.advice = Some(advice);
        self
    }

    pub fn with_connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.connection_type = Some(connection_type);
        self
    }

    pub fn is_successful(&self) -> bool {
        self.successful.unwrap_or(false)
    }

    pub fn kind(&self) -> Result<ChannelKind, ProtocolError> {
        ChannelKind::classify(&self.channel)
    }
}

/// Control actions carried on `/meta/*` channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaAction {
    Handshake,
    Connect,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Other(String),
}

/// Routing class of a channel name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Meta(MetaAction),
    /// `/service/**`: private request/response traffic, never broadcast.
    Service,
    /// Any other well-formed channel: fanned out to subscribers.
    Broadcast,
}

impl ChannelKind {
    pub fn classify(name: &str) -> Result<Self, ProtocolError> {
        if !is_valid_channel_name(name) {
            return Err(ProtocolError::UnknownChannel(name.to_string()));
        }

        if let Some(action) = name.strip_prefix(META_PREFIX) {
            let action = match action {
                "handshake" => MetaAction::Handshake,
                "connect" => MetaAction::Connect,
                "subscribe" => MetaAction::Subscribe,
                "unsubscribe" => MetaAction::Unsubscribe,
                "disconnect" => MetaAction::Disconnect,
                other => MetaAction::Other(other.to_string()),
            };
            return Ok(ChannelKind::Meta(action));
        }

        if name.starts_with(SERVICE_PREFIX) {
            return Ok(ChannelKind::Service);
        }

        Ok(ChannelKind::Broadcast)
    }
}

pub fn is_meta_channel(name: &str) -> bool {
    name.starts_with(META_PREFIX)
}

pub fn is_service_channel(name: &str) -> bool {
    name.starts_with(SERVICE_PREFIX)
}

/// `/segment(/segment)*` with non-empty, whitespace-free segments.
pub fn is_valid_channel_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('/') else {
        return false;
    };
    !rest.is_empty()
        && rest
            .split('/')
            .all(|segment| !segment.is_empty() && !segment.chars().any(char::is_whitespace))
}
