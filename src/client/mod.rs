//! The `client` module holds the broker-side view of Bayeux clients.
//!
//! `record::Client` is the state of one handshaken client (pending queue and
//! parked long-poll), and `table::ClientTable` maps client IDs to those
//! records.

pub mod record;
pub mod table;

pub use record::{Client, PendingConnect};
pub use table::{ClientIdGenerator, ClientTable};
