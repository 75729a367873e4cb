//! The `error` module defines the error types used across `bayeux`.
//!
//! Protocol and authorization failures are mostly reported *inside* the
//! protocol as `successful: false` responses; only the few that cannot be
//! expressed as a response (malformed bodies, unroutable requests) escape to
//! the HTTP layer. Transport failures belong to the connector, which recovers
//! from them on its own.

use thiserror::Error;

/// A request that cannot be turned into a well-formed exchange.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The `message` field was not a JSON message or array of messages.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A required field was absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// The channel name is not a routable absolute path.
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),

    /// The JSONP callback is not a plain JavaScript identifier path.
    #[error("invalid JSONP callback `{0}`")]
    InvalidCallback(String),
}

/// A well-formed request the broker refuses to honour.
///
/// The `Display` form follows the Bayeux `code:args:message` convention and is
/// placed verbatim in the response's `error` field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    #[error("402:{0}:Unknown client")]
    UnknownClient(String),

    #[error("403:{0}:Forbidden subscription")]
    MetaSubscription(String),

    #[error("403:{0}:Forbidden channel")]
    MetaChannel(String),
}

/// Failure to complete an HTTP exchange from the connector side.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered with status {0}")]
    Status(u16),

    #[error("undecodable response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("response is not wrapped in the expected JSONP callback")]
    Jsonp,

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}
