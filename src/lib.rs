//! # Bayeux
//!
//! `bayeux` is an in-memory publish/subscribe message bus speaking the Bayeux
//! protocol over HTTP long-polling. Clients handshake for an identity,
//! subscribe to hierarchical channels, publish JSON payloads and receive
//! messages by parking a `/meta/connect` request until something arrives.
//!
//! ## Core Modules
//!
//! - `broker`: channel registry, message dispatch and long-poll parking.
//! - `client`: per-client server-side state: queue and waiter slot.
//! - `config`: loading server, broker and connector settings.
//! - `connector`: the client side; a reconnecting, batching connector.
//! - `transport`: the HTTP endpoint (form POST and JSONP GET).
//! - `utils`: error taxonomy and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod connector;
pub mod transport;
pub mod utils;
