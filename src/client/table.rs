//! Client table
//!
//! Maps client IDs to their `Client` state and mints new IDs. All access goes
//! through the broker lock.

use std::collections::HashMap;

use uuid::Uuid;

use crate::broker::message::Message;
use crate::client::record::Client;
use crate::config::ClientIdStrategy;

/// Mints client identities at handshake.
///
/// `Sequential` is guessable and only suitable for trusted deployments and
/// tests; `Random` issues UUIDv4 strings.
#[derive(Debug)]
pub enum ClientIdGenerator {
    Sequential { last: u64 },
    Random,
}

impl ClientIdGenerator {
    pub fn new(strategy: ClientIdStrategy) -> Self {
        match strategy {
            ClientIdStrategy::Sequential => ClientIdGenerator::Sequential { last: 0 },
            ClientIdStrategy::Random => ClientIdGenerator::Random,
        }
    }

    pub fn next_id(&mut self) -> String {
        match self {
            ClientIdGenerator::Sequential { last } => {
                *last += 1;
                last.to_string()
            }
            ClientIdGenerator::Random => Uuid::new_v4().simple().to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ClientTable {
    clients: HashMap<String, Client>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fresh client with an empty queue and no waiter, replacing any
    /// previous record under the same ID.
    pub fn create(&mut self, client_id: &str) -> &mut Client {
        if let Some(mut previous) = self.clients.remove(client_id) {
            previous.cancel_waiter();
        }
        self.clients
            .entry(client_id.to_string())
            .or_insert_with(|| Client::new(client_id))
    }

    pub fn get(&self, client_id: &str) -> Option<&Client> {
        self.clients.get(client_id)
    }

    pub fn get_mut(&mut self, client_id: &str) -> Option<&mut Client> {
        self.clients.get_mut(client_id)
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    /// Queues `message` for `client_id`, waking its long-poll if one is
    /// parked. Returns `false` for unknown clients.
    pub fn enqueue(&mut self, client_id: &str, message: Message) -> bool {
        match self.clients.get_mut(client_id) {
            Some(client) => {
                client.push(message);
                true
            }
            None => false,
        }
    }

    /// Drops a client. Its waiter, if any, is answered before the record goes.
    pub fn remove(&mut self, client_id: &str) -> Option<Client> {
        let mut client = self.clients.remove(client_id)?;
        client.cancel_waiter();
        Some(client)
    }

    /// IDs of clients with no parked long-poll whose last request is older
    /// than `timeout_ms` at `now_ms`.
    pub fn idle(&self, now_ms: i64, timeout_ms: i64) -> Vec<String> {
        self.clients
            .values()
            .filter(|c| !c.has_waiter() && now_ms - c.last_seen > timeout_ms)
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.clients.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
