//! The broker: Bayeux message dispatch over an in-memory channel registry
//! and client table.

pub mod channel;
pub mod engine;
pub mod long_poll;
pub mod message;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use engine::{Broker, Delivery, Exchange, Extension, Intercept, Outcome};
pub use message::Message;

/// The broker as shared between request handlers and background tasks.
pub type SharedBroker = Arc<Mutex<Broker>>;

pub fn shared(broker: Broker) -> SharedBroker {
    Arc::new(Mutex::new(broker))
}

/// Locks the broker, recovering the guard if a previous holder panicked.
pub fn lock(broker: &SharedBroker) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests;
