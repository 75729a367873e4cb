//! Broker engine
//!
//! This module contains the in-memory Bayeux broker responsible for:
//! - minting client identities at handshake
//! - managing channel subscriptions
//! - parking `/meta/connect` long-polls and waking them on publish
//! - fanning published messages out to subscriber queues
//! - announcing new sessions on the `/cometd/meta` lifecycle channel
//! - expiring clients that stopped polling
//!
//! Concurrency and usage notes:
//! - The public API here is synchronous and designed to be held behind a
//!   lock (`SharedBroker`) by the transport layer. Every handler runs to
//!   completion under that lock, so publish and waiter registration can never
//!   interleave.
//! - A connect that has nothing to deliver yields `Outcome::Suspend`; the
//!   transport then awaits it with [`crate::broker::long_poll::hold`] outside
//!   the lock.
//! - The sweep loop is designed to be run as a background task and removes
//!   idle clients periodically.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::broker::SharedBroker;
use crate::broker::channel::ChannelRegistry;
use crate::broker::lock;
use crate::broker::message::{
    Advice, BAYEUX_VERSION, ChannelKind, ConnectionType, Message, MetaAction, is_meta_channel,
    is_service_channel, is_valid_channel_name,
};
use crate::client::{ClientIdGenerator, ClientTable, PendingConnect};
use crate::config::BrokerSettings;
use crate::utils::{AuthorizationError, ProtocolError};

/// Per-request context supplied by the transport.
#[derive(Debug, Clone, Copy)]
pub struct Exchange {
    pub connection_type: ConnectionType,
}

impl Default for Exchange {
    fn default() -> Self {
        Self {
            connection_type: ConnectionType::LongPolling,
        }
    }
}

/// Result of dispatching one message.
#[derive(Debug)]
pub enum Outcome {
    /// Zero or more responses to send now.
    Reply(Vec<Message>),
    /// A long-poll was parked and must be held open.
    Suspend(PendingConnect),
}

/// Result of dispatching one HTTP exchange.
///
/// When `pending` is set, `responses` is empty and the transport should hold
/// the request open until the pending connect resolves.
#[derive(Debug, Default)]
pub struct Delivery {
    pub responses: Vec<Message>,
    pub pending: Option<PendingConnect>,
}

/// Decision returned by [`Extension::incoming`].
#[derive(Debug)]
pub enum Intercept {
    /// Let the broker dispatch the message as usual.
    Continue,
    /// Skip the broker's dispatch and answer with these messages instead.
    Respond(Vec<Message>),
}

/// Application hook into the dispatch of every inbound message.
///
/// Applications built on the bus (presence rosters, private services)
/// implement this to intercept specific channels and leave the rest to the
/// broker.
pub trait Extension: Send + Sync {
    fn incoming(&self, _broker: &mut Broker, _message: &Message) -> Intercept {
        Intercept::Continue
    }

    /// Runs after the broker has dispatched `message` itself.
    fn dispatched(&self, _broker: &mut Broker, _message: &Message) {}
}

pub struct Broker {
    channels: ChannelRegistry,
    clients: ClientTable,
    ids: ClientIdGenerator,
    settings: BrokerSettings,
    extensions: Vec<Arc<dyn Extension>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("channels", &self.channels)
            .field("clients", &self.clients)
            .field("settings", &self.settings)
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

impl Broker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            channels: ChannelRegistry::new(),
            clients: ClientTable::new(),
            ids: ClientIdGenerator::new(settings.client_ids),
            settings,
            extensions: Vec::new(),
        }
    }

    pub fn with_extension<E: Extension + 'static>(mut self, extension: E) -> Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn clients(&self) -> &ClientTable {
        &self.clients
    }

    pub fn clients_mut(&mut self) -> &mut ClientTable {
        &mut self.clients
    }

    /// Dispatches every message of one HTTP exchange, in order.
    ///
    /// An exchange made only of unroutable messages fails as a whole; inside a
    /// mixed batch an unroutable message gets a failure response and the rest
    /// proceed. A handler or extension that panics fails only its own
    /// message.
    pub fn deliver_all(
        &mut self,
        messages: Vec<Message>,
        exchange: Exchange,
    ) -> Result<Delivery, ProtocolError> {
        let total = messages.len();
        let mut failed = 0;
        let mut last_error = None;
        let mut delivery = Delivery::default();

        for message in &messages {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.deliver(message, exchange)));
            let Ok(outcome) = outcome else {
                error!(channel = %message.channel, "message handler panicked");
                delivery
                    .responses
                    .push(Message::reply_to(message).with_error("500::Internal error"));
                continue;
            };
            match outcome {
                Ok(Outcome::Reply(responses)) => delivery.responses.extend(responses),
                Ok(Outcome::Suspend(pending)) => {
                    if let Some(mut older) = delivery.pending.replace(pending) {
                        // already answered by the newer connect superseding it
                        let batch = self.settle(&mut older);
                        delivery.responses.extend(batch);
                    }
                }
                Err(err) => {
                    warn!(channel = %message.channel, error = %err, "unroutable message");
                    failed += 1;
                    delivery.responses.push(
                        Message::reply_to(message)
                            .with_error(format!("400:{}:Unknown channel", message.channel)),
                    );
                    last_error = Some(err);
                }
            }
        }

        if total > 0 && failed == total {
            if let Some(err) = last_error {
                return Err(err);
            }
        }

        // a request cannot be both answered and held: release the waiter now
        if !delivery.responses.is_empty() {
            if let Some(mut pending) = delivery.pending.take() {
                let batch = self.settle(&mut pending);
                delivery.responses.extend(batch);
            }
        }

        Ok(delivery)
    }

    /// Dispatches a single message.
    pub fn deliver(
        &mut self,
        message: &Message,
        exchange: Exchange,
    ) -> Result<Outcome, ProtocolError> {
        let kind = message.kind()?;

        for extension in self.extensions.clone() {
            if let Intercept::Respond(responses) = extension.incoming(self, message) {
                return Ok(Outcome::Reply(responses));
            }
        }

        let outcome = match kind {
            ChannelKind::Meta(MetaAction::Handshake) => {
                Outcome::Reply(vec![self.handshake(message, exchange)])
            }
            ChannelKind::Meta(MetaAction::Connect) => self.connect(message, exchange),
            ChannelKind::Meta(MetaAction::Subscribe) => Outcome::Reply(vec![self.subscribe(message)]),
            ChannelKind::Meta(MetaAction::Unsubscribe) => {
                Outcome::Reply(vec![self.unsubscribe(message)])
            }
            ChannelKind::Meta(MetaAction::Disconnect) => {
                Outcome::Reply(vec![self.disconnect(message)])
            }
            ChannelKind::Meta(MetaAction::Other(action)) => {
                debug!(client_id = ?message.client_id, action = %action, "message to reserved meta channel");
                Outcome::Reply(vec![
                    Message::reply_to(message)
                        .with_error(AuthorizationError::MetaChannel(message.channel.clone())),
                ])
            }
            ChannelKind::Service => {
                debug!(client_id = ?message.client_id, channel = %message.channel, "private service message");
                Outcome::Reply(vec![Message::reply_to(message).with_successful(true)])
            }
            ChannelKind::Broadcast => Outcome::Reply(vec![self.publish_from(message)]),
        };

        for extension in self.extensions.clone() {
            extension.dispatched(self, message);
        }

        Ok(outcome)
    }

    /// Fans `data` out to every subscriber of `channel`, waking their parked
    /// long-polls. Returns the number of queues it reached.
    pub fn publish(&mut self, channel: &str, data: Value) -> usize {
        if is_meta_channel(channel) || is_service_channel(channel) {
            warn!(channel, "refusing to broadcast on a reserved channel");
            return 0;
        }

        self.fan_out(Message::broadcast(channel, data))
    }

    fn fan_out(&mut self, message: Message) -> usize {
        let channel = message.channel.as_str();
        let subscribers = self.channels.subscribers(channel);
        let mut delivered = 0;

        for client_id in &subscribers {
            if self.clients.enqueue(client_id, message.clone()) {
                delivered += 1;
            } else {
                debug!(client_id = %client_id, channel, "subscriber has no client record");
            }
        }

        debug!(channel, subscribers = subscribers.len(), delivered, "published");
        delivered
    }

    /// Removes a client and all of its subscriptions, answering any parked
    /// long-poll first.
    pub fn cleanup_client(&mut self, client_id: &str) -> bool {
        let existed = self.clients.remove(client_id).is_some();
        self.channels.unsubscribe_all(client_id);
        if existed {
            info!(client_id, "client removed");
        }
        existed
    }

    /// Removes every client idle for longer than the configured timeout.
    pub fn expire_idle(&mut self, now_ms: i64) -> Vec<String> {
        let timeout_ms = i64::try_from(self.settings.client_timeout_secs.saturating_mul(1000))
            .unwrap_or(i64::MAX);
        let expired = self.clients.idle(now_ms, timeout_ms);
        for client_id in &expired {
            self.cleanup_client(client_id);
        }
        expired
    }

    pub async fn start_sweep_loop(broker: SharedBroker) {
        let interval = lock(&broker).settings.sweep_interval();
        loop {
            tokio::time::sleep(interval).await;

            let now = chrono::Utc::now().timestamp_millis();
            let expired = lock(&broker).expire_idle(now);
            if !expired.is_empty() {
                info!(count = expired.len(), "expired idle clients");
            }
        }
    }

    /// Resolves a parked connect from the broker side: if its waiter is still
    /// registered it is released and the queue flushed for it, otherwise the
    /// batch it was already sent is collected.
    pub(crate) fn settle(&mut self, pending: &mut PendingConnect) -> Vec<Message> {
        if let Some(client) = self.clients.get_mut(&pending.client_id) {
            if let Some(batch) = client.release_waiter(pending.waiter_id) {
                return batch;
            }
        }
        pending
            .rx
            .try_recv()
            .unwrap_or_else(|_| vec![pending.ack.clone()])
    }

    /// Tears down a parked connect whose HTTP request went away. Anything
    /// already handed to it goes back to the client's queue.
    pub(crate) fn abandon(&mut self, pending: &mut PendingConnect) {
        let batch = match self.clients.get_mut(&pending.client_id) {
            Some(client) => client.release_waiter(pending.waiter_id),
            None => return,
        };
        let batch = match batch {
            Some(batch) => batch,
            None => match pending.rx.try_recv() {
                Ok(batch) => batch,
                Err(_) => return,
            },
        };
        if let Some(client) = self.clients.get_mut(&pending.client_id) {
            client.requeue_front(batch);
        }
    }

    fn handshake(&mut self, request: &Message, exchange: Exchange) -> Message {
        let client_id = self.ids.next_id();
        self.clients.create(&client_id);
        info!(client_id = %client_id, connection_type = ?exchange.connection_type, "handshake");

        let mut handshake = Message::lifecycle("handshake");
        handshake.reestablish = Some(false);
        self.fan_out(handshake);
        self.fan_out(Message::lifecycle("connect"));

        let mut response = Message::reply_to(request)
            .with_client_id(client_id)
            .with_successful(true)
            .with_advice(self.advice(exchange));
        response.version = Some(BAYEUX_VERSION.to_string());
        response.minimum_version = request.minimum_version.clone();
        response.supported_connection_types = Some(ConnectionType::ALL.to_vec());
        response
    }

    fn subscribe(&mut self, request: &Message) -> Message {
        let response = Message::reply_to(request);
        let Some(subscription) = request.subscription.as_deref() else {
            return response.with_error("400::Missing subscription");
        };
        let response = response.with_subscription(subscription);

        let client_id = match self.known_client(request) {
            Ok(client_id) => client_id,
            Err(err) => return response.with_error(err).with_advice(Advice::handshake()),
        };

        if !is_valid_channel_name(subscription) {
            return response.with_error(format!("400:{subscription}:Invalid channel"));
        }

        match self.channels.subscribe(subscription, &client_id) {
            Ok(()) => {
                debug!(client_id = %client_id, subscription, "subscribed");
                response.with_successful(true)
            }
            Err(err) => {
                warn!(client_id = %client_id, subscription, "refused meta subscription");
                response.with_error(err)
            }
        }
    }

    fn unsubscribe(&mut self, request: &Message) -> Message {
        let response = Message::reply_to(request);
        let Some(subscription) = request.subscription.as_deref() else {
            return response.with_error("400::Missing subscription");
        };

        if let Some(client_id) = request.client_id.as_deref() {
            self.channels.unsubscribe(subscription, client_id);
            if let Some(client) = self.clients.get_mut(client_id) {
                client.touch();
            }
            debug!(client_id, subscription, "unsubscribed");
        }

        response.with_subscription(subscription).with_successful(true)
    }

    fn connect(&mut self, request: &Message, exchange: Exchange) -> Outcome {
        let ack = Message::reply_to(request)
            .with_successful(true)
            .with_advice(self.advice(exchange));

        let client = match request.client_id.as_deref() {
            Some(client_id) => self.clients.get_mut(client_id),
            None => None,
        };
        let Some(client) = client else {
            let err = AuthorizationError::UnknownClient(request.client_id.clone().unwrap_or_default());
            debug!(error = %err, "connect from unknown client");
            return Outcome::Reply(vec![
                Message::reply_to(request)
                    .with_error(err)
                    .with_advice(Advice::handshake()),
            ]);
        };

        client.touch();
        client.connected = true;

        let superseded = client.cancel_waiter();
        if superseded {
            debug!(client_id = %client.id, "overlapping connect; older long-poll answered");
        }

        if superseded || client.queue_len() > 0 {
            return Outcome::Reply(client.flush(ack));
        }

        debug!(client_id = %client.id, "long-poll parked");
        Outcome::Suspend(client.wait(ack))
    }

    fn disconnect(&mut self, request: &Message) -> Message {
        let response = Message::reply_to(request);
        match request.client_id.as_deref() {
            Some(client_id) if self.cleanup_client(client_id) => response.with_successful(true),
            client_id => response.with_error(AuthorizationError::UnknownClient(
                client_id.unwrap_or_default().to_string(),
            )),
        }
    }

    fn publish_from(&mut self, request: &Message) -> Message {
        let response = Message::reply_to(request);
        if let Err(err) = self.known_client(request) {
            return response.with_error(err).with_advice(Advice::handshake());
        }

        if let Some(data) = request.data.clone() {
            self.publish(&request.channel, data);
        } else {
            debug!(channel = %request.channel, "publish without data is not broadcast");
        }
        response.with_successful(true)
    }

    fn known_client(&mut self, request: &Message) -> Result<String, AuthorizationError> {
        let client_id = request.client_id.clone().unwrap_or_default();
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.touch();
                Ok(client_id)
            }
            None => Err(AuthorizationError::UnknownClient(client_id)),
        }
    }

    fn advice(&self, exchange: Exchange) -> Advice {
        let timeout_ms = self.settings.poll_timeout_secs.saturating_mul(1000);
        Advice::retry(self.settings.interval_for(exchange.connection_type)).with_timeout(timeout_ms)
    }
}
