//! Client side of the protocol: a reconnecting, batching Bayeux connector.

pub mod backoff;
pub mod engine;
pub mod transport;

pub use backoff::Backoff;
pub use engine::{Callback, Connector, ConnectorState};
pub use transport::{HttpTransport, Transport};
