//! The `transport` module is responsible for handling network communication
//! with clients over the Bayeux HTTP binding.
//!
//! It defines the request envelope (`message` and `jsonp` parameters), and
//! implements the axum endpoint that parses exchanges, forwards them to the
//! broker and holds long-polls open until they resolve.

pub mod http;
pub mod message;

pub use http::{router, serve, start_http_server};
