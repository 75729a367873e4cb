//! The `utils` module provides the pieces shared by the broker, the connector
//! and the binary: the error taxonomy and logging setup.

pub mod error;
pub mod logging;

pub use error::{AuthorizationError, ProtocolError, TransportError};
