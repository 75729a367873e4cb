//! Channel management
//!
//! A `Channel` holds the set of client IDs subscribed to a channel name, and
//! the `ChannelRegistry` maps names to channels. Subscriptions are stored as a
//! `HashSet`, so a duplicate subscribe is a no-op. Meta channels are refused
//! here, so no code path can ever place a client on `/meta/**`.
//!
//! Concurrency note: callers must synchronize access (the broker lock does).

use std::collections::{HashMap, HashSet};

use crate::broker::message::is_meta_channel;
use crate::utils::AuthorizationError;

pub type SubscriberId = String;

#[derive(Debug, Default)]
pub struct Channel {
    pub name: String,
    pub subscribers: HashSet<SubscriberId>,
}

impl Channel {
    /// Create a new channel with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashSet::new(),
        }
    }

    /// Add a subscriber to the channel. Returns `false` if it was already there.
    pub fn subscribe(&mut self, id: SubscriberId) -> bool {
        self.subscribers.insert(id)
    }

    /// Remove a subscriber from the channel.
    pub fn unsubscribe(&mut self, id: &str) -> bool {
        self.subscribers.remove(id)
    }
}

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a client to a channel, creating the channel on first use.
    pub fn subscribe(&mut self, channel: &str, client_id: &str) -> Result<(), AuthorizationError> {
        if is_meta_channel(channel) {
            return Err(AuthorizationError::MetaSubscription(channel.to_string()));
        }

        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| Channel::new(channel))
            .subscribe(client_id.to_string());
        Ok(())
    }

    /// Removes a client from a channel. Unknown channels and non-members are
    /// ignored. Channels left without subscribers are dropped.
    pub fn unsubscribe(&mut self, channel: &str, client_id: &str) {
        if let Some(c) = self.channels.get_mut(channel) {
            c.unsubscribe(client_id);
            if c.subscribers.is_empty() {
                self.channels.remove(channel);
            }
        }
    }

    /// Removes a client from every channel it belongs to.
    pub fn unsubscribe_all(&mut self, client_id: &str) {
        self.channels.retain(|_, c| {
            c.unsubscribe(client_id);
            !c.subscribers.is_empty()
        });
    }

    /// Snapshot of the subscribers of `channel`, empty if nobody listens.
    pub fn subscribers(&self, channel: &str) -> Vec<SubscriberId> {
        self.channels
            .get(channel)
            .map(|c| c.subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, channel: &str, client_id: &str) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|c| c.subscribers.contains(client_id))
    }

    pub fn get(&self, channel: &str) -> Option<&Channel> {
        self.channels.get(channel)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
