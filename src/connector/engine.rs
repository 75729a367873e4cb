//! Connector engine
//!
//! The client half of the protocol. A [`Connector`] walks the lifecycle
//! `Disconnected -> Handshaking -> Connected -> Disconnected`, dropping into
//! `ReconnectWait` while a failed exchange backs off.
//!
//! Concurrency notes:
//! - All state lives in one `Session` behind a std mutex that is never held
//!   across an `.await`. Message ids are stamped under that lock when a
//!   message is queued, so ids grow in enqueue order whatever the batching.
//! - The handshake and the long-poll each run as a spawned task tagged with
//!   the session generation. Disconnecting or re-handshaking bumps the
//!   generation; a task or response from an older generation is discarded.
//! - `Notify` wakes tasks sleeping out a backoff or interval so they notice a
//!   disconnect promptly.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::broker::message::{
    Advice, BAYEUX_VERSION, META_CONNECT, META_DISCONNECT, META_HANDSHAKE, META_SUBSCRIBE,
    META_UNSUBSCRIBE, MINIMUM_VERSION, Message, Reconnect, is_meta_channel,
};
use crate::config::ConnectorSettings;
use crate::connector::backoff::Backoff;
use crate::connector::transport::Transport;

/// Application callback for messages arriving on a subscribed channel.
pub type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Handshaking,
    Connected,
    /// Backing off after a failed exchange.
    ReconnectWait,
}

struct Session {
    state: ConnectorState,
    client_id: Option<String>,
    next_id: u64,
    batch_depth: usize,
    outbound: VecDeque<Message>,
    subscriptions: HashMap<String, Callback>,
    /// Called for every data message, whatever its channel.
    listeners: Vec<Callback>,
    advice: Advice,
    backoff: Backoff,
    generation: u64,
    /// Token of the poll loop allowed to run, if any.
    poller: Option<u64>,
    next_poller: u64,
}

impl Session {
    fn new(backoff: Backoff) -> Self {
        Self {
            state: ConnectorState::Disconnected,
            client_id: None,
            next_id: 0,
            batch_depth: 0,
            outbound: VecDeque::new(),
            subscriptions: HashMap::new(),
            listeners: Vec::new(),
            advice: Advice::default(),
            backoff,
            generation: 0,
            poller: None,
            next_poller: 0,
        }
    }

    fn stamp(&mut self, message: Message) -> Message {
        self.next_id += 1;
        message.with_id(self.next_id.to_string())
    }

    fn enqueue(&mut self, message: Message) {
        let message = self.stamp(message);
        self.outbound.push_back(message);
    }

    /// Takes the whole outbound queue, stamped with the current client id.
    fn drain_outbound(&mut self, client_id: &str) -> Vec<Message> {
        self.outbound
            .drain(..)
            .map(|message| message.with_client_id(client_id))
            .collect()
    }

    fn requeue(&mut self, batch: Vec<Message>) {
        for message in batch.into_iter().rev() {
            self.outbound.push_front(message);
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.advice.interval.unwrap_or(0))
    }

    fn sorted_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.subscriptions.keys().cloned().collect();
        channels.sort();
        channels
    }
}

struct Inner<T> {
    transport: T,
    session: Mutex<Session>,
    wake: Notify,
}

/// A Bayeux client connection. Cloning yields another handle to the same
/// connection.
pub struct Connector<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Connector<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> fmt::Debug for Connector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.inner.session();
        f.debug_struct("Connector")
            .field("state", &session.state)
            .field("client_id", &session.client_id)
            .field("subscriptions", &session.subscriptions.len())
            .field("outbound", &session.outbound.len())
            .finish()
    }
}

impl<T: Transport> Connector<T> {
    pub fn new(transport: T, settings: &ConnectorSettings) -> Self {
        Self::with_backoff(transport, Backoff::from_settings(settings))
    }

    pub fn with_backoff(transport: T, backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                session: Mutex::new(Session::new(backoff)),
                wake: Notify::new(),
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn state(&self) -> ConnectorState {
        self.inner.session().state
    }

    pub fn client_id(&self) -> Option<String> {
        self.inner.session().client_id.clone()
    }

    /// Consecutive failed exchanges; reset by the next success.
    pub fn error_count(&self) -> u32 {
        self.inner.session().backoff.failures()
    }

    /// Starts the handshake in the background. Must be called from within a
    /// tokio runtime. Does nothing unless disconnected.
    pub fn connect(&self) {
        let generation = {
            let mut session = self.inner.session();
            if session.state != ConnectorState::Disconnected {
                return;
            }
            session.generation += 1;
            session.state = ConnectorState::Handshaking;
            session.backoff.reset();
            session.generation
        };
        self.inner.spawn_handshake(generation);
    }

    pub async fn publish(&self, channel: &str, data: Value) {
        self.inner
            .session()
            .enqueue(Message::new(channel).with_data(data));
        self.inner.flush().await;
    }

    /// Routes messages on `channel` to `callback`. Subscribing again replaces
    /// the callback without another round trip.
    pub async fn subscribe<F>(&self, channel: &str, callback: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        {
            let mut session = self.inner.session();
            let fresh = session
                .subscriptions
                .insert(channel.to_string(), Arc::new(callback))
                .is_none();
            if !fresh {
                return;
            }
            session.enqueue(Message::new(META_SUBSCRIBE).with_subscription(channel));
        }
        self.inner.flush().await;
    }

    /// Registers `listener` for every data message the connector receives,
    /// on any channel, ahead of the per-channel callback. Listeners stay
    /// registered across disconnects.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.session().listeners.push(Arc::new(listener));
    }

    pub async fn unsubscribe(&self, channel: &str) {
        {
            let mut session = self.inner.session();
            if session.subscriptions.remove(channel).is_none() {
                return;
            }
            session.enqueue(Message::new(META_UNSUBSCRIBE).with_subscription(channel));
        }
        self.inner.flush().await;
    }

    /// Holds back outbound messages until the matching [`Connector::end_batch`].
    /// Batches nest.
    pub fn start_batch(&self) {
        self.inner.session().batch_depth += 1;
    }

    pub async fn end_batch(&self) {
        {
            let mut session = self.inner.session();
            session.batch_depth = session.batch_depth.saturating_sub(1);
        }
        self.inner.flush().await;
    }

    /// Unsubscribes from everything, says goodbye to the broker and stops all
    /// background activity. A long-poll still in flight is ignored when it
    /// returns.
    pub async fn disconnect(&self) {
        let batch = {
            let mut session = self.inner.session();
            if session.state == ConnectorState::Disconnected {
                return;
            }

            let previous = session.state;
            let client_id = session.client_id.take();
            session.state = ConnectorState::Disconnected;
            session.generation += 1;
            session.poller = None;
            session.batch_depth = 0;

            let channels = session.sorted_channels();
            session.subscriptions.clear();

            match client_id {
                Some(client_id) if previous != ConnectorState::Handshaking => {
                    for channel in channels {
                        session.enqueue(Message::new(META_UNSUBSCRIBE).with_subscription(channel));
                    }
                    session.enqueue(Message::new(META_DISCONNECT));
                    session.drain_outbound(&client_id)
                }
                _ => {
                    session.outbound.clear();
                    Vec::new()
                }
            }
        };
        self.inner.wake.notify_waiters();

        if batch.is_empty() {
            info!("connector stopped");
            return;
        }

        match self.inner.transport.send(batch).await {
            Ok(responses) => {
                let acknowledged = responses
                    .iter()
                    .any(|m| m.channel == META_DISCONNECT && m.is_successful());
                info!(acknowledged, "disconnected");
            }
            Err(err) => warn!(error = %err, "disconnect request failed"),
        }
    }
}

impl<T: Transport> Inner<T> {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session().generation == generation
    }

    fn spawn_handshake(self: &Arc<Self>, generation: u64) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.handshake_loop(generation).await });
    }

    fn spawn_poll(self: &Arc<Self>, generation: u64, token: u64) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.poll_loop(generation, token).await });
    }

    async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.wake.notified() => {}
        }
    }

    /// Retries the handshake until it succeeds or the generation moves on.
    async fn handshake_loop(self: Arc<Self>, generation: u64) {
        loop {
            let request = {
                let mut session = self.session();
                if session.generation != generation {
                    return;
                }
                session.state = ConnectorState::Handshaking;

                let mut request = Message::new(META_HANDSHAKE);
                request.version = Some(BAYEUX_VERSION.to_string());
                request.minimum_version = Some(MINIMUM_VERSION.to_string());
                request.supported_connection_types = Some(vec![self.transport.connection_type()]);
                session.stamp(request)
            };

            let failure = match self.transport.send(vec![request]).await {
                Ok(responses) => {
                    match responses.into_iter().find(|m| m.channel == META_HANDSHAKE) {
                        Some(response) if response.is_successful() && response.client_id.is_some() => {
                            self.established(response, generation).await;
                            return;
                        }
                        Some(response) => response
                            .error
                            .unwrap_or_else(|| "handshake refused".to_string()),
                        None => "no handshake response".to_string(),
                    }
                }
                Err(err) => err.to_string(),
            };

            let delay = {
                let mut session = self.session();
                if session.generation != generation {
                    return;
                }
                session.state = ConnectorState::ReconnectWait;
                session.backoff.next_delay()
            };
            warn!(error = %failure, retry_in = ?delay, "handshake failed");
            self.pause(delay).await;
        }
    }

    async fn established(self: &Arc<Self>, response: Message, generation: u64) {
        {
            let mut session = self.session();
            if session.generation != generation {
                return;
            }
            session.client_id = response.client_id.clone();
            session.state = ConnectorState::Connected;
            session.backoff.reset();
            info!(client_id = ?session.client_id, "handshake complete");
        }
        self.apply_advice(response.advice.as_ref(), generation);
        self.flush().await;
    }

    async fn poll_loop(self: Arc<Self>, generation: u64, token: u64) {
        debug!(generation, "poll loop started");
        loop {
            let request = {
                let mut session = self.session();
                if session.generation != generation || session.poller != Some(token) {
                    break;
                }
                let Some(client_id) = session.client_id.clone() else {
                    break;
                };
                let connect = Message::new(META_CONNECT)
                    .with_client_id(client_id)
                    .with_connection_type(self.transport.connection_type());
                session.stamp(connect)
            };

            let delay = match self.transport.send(vec![request]).await {
                Ok(responses) => {
                    // an answered poll goes straight back; only an empty one waits
                    let answered = !responses.is_empty();
                    {
                        let mut session = self.session();
                        if session.generation != generation {
                            break;
                        }
                        session.state = ConnectorState::Connected;
                        session.backoff.reset();
                    }
                    self.receive(responses, generation);
                    if !self.is_current(generation) {
                        break;
                    }
                    self.flush().await;
                    let interval = self.session().interval();
                    if answered { Duration::ZERO } else { interval }
                }
                Err(err) => {
                    let delay = {
                        let mut session = self.session();
                        if session.generation != generation {
                            break;
                        }
                        session.state = ConnectorState::ReconnectWait;
                        session.backoff.next_delay()
                    };
                    warn!(error = %err, retry_in = ?delay, "long-poll failed");
                    delay
                }
            };

            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                self.pause(delay).await;
            }
        }
        debug!(generation, "poll loop stopped");
    }

    /// Sends the outbound queue as one exchange, unless a batch is open or
    /// there is no live session to send it on.
    async fn flush(self: &Arc<Self>) {
        let (batch, generation) = {
            let mut session = self.session();
            if session.state != ConnectorState::Connected
                || session.batch_depth > 0
                || session.outbound.is_empty()
            {
                return;
            }
            let Some(client_id) = session.client_id.clone() else {
                return;
            };
            (session.drain_outbound(&client_id), session.generation)
        };

        match self.transport.send(batch.clone()).await {
            Ok(responses) => {
                self.session().backoff.reset();
                self.receive(responses, generation);
            }
            Err(err) => {
                let mut session = self.session();
                if session.generation != generation {
                    return;
                }
                warn!(error = %err, count = batch.len(), "send failed; messages requeued");
                session.requeue(batch);
                session.backoff.next_delay();
            }
        }
    }

    /// Dispatches the data messages of a response to the listeners and their
    /// channel callbacks, and acts on any advice.
    fn receive(self: &Arc<Self>, responses: Vec<Message>, generation: u64) {
        let mut advice = None;
        let mut deliveries = Vec::new();
        {
            let session = self.session();
            if session.generation != generation {
                debug!(count = responses.len(), "discarding stale response");
                return;
            }
            for message in responses {
                if message.advice.is_some() {
                    advice = message.advice.clone();
                }
                if is_meta_channel(&message.channel) {
                    if !message.is_successful() {
                        debug!(channel = %message.channel, error = ?message.error, "request refused");
                    }
                    continue;
                }
                // acknowledgements and other bookkeeping carry no data
                if message.data.is_none() {
                    continue;
                }
                let mut callbacks: Vec<Callback> = session.listeners.to_vec();
                if let Some(callback) = session.subscriptions.get(&message.channel) {
                    callbacks.push(Arc::clone(callback));
                }
                if !callbacks.is_empty() {
                    deliveries.push((callbacks, message));
                }
            }
        }

        for (callbacks, message) in &deliveries {
            for callback in callbacks {
                callback(message);
            }
        }

        if advice.is_some() {
            self.apply_advice(advice.as_ref(), generation);
        }
    }

    /// `None` means no advice was given, which behaves as `retry`.
    fn apply_advice(self: &Arc<Self>, advice: Option<&Advice>, generation: u64) {
        let mut session = self.session();
        if session.generation != generation || session.state == ConnectorState::Disconnected {
            return;
        }
        if let Some(advice) = advice {
            if advice.reconnect.is_some() {
                session.advice.reconnect = advice.reconnect;
            }
            if advice.interval.is_some() {
                session.advice.interval = advice.interval;
            }
            if advice.timeout.is_some() {
                session.advice.timeout = advice.timeout;
            }
        }

        match advice.and_then(|a| a.reconnect) {
            Some(Reconnect::Handshake) => {
                session.generation += 1;
                session.client_id = None;
                session.poller = None;
                session.state = ConnectorState::Handshaking;
                session.advice.reconnect = None;
                for channel in session.sorted_channels() {
                    session.enqueue(Message::new(META_SUBSCRIBE).with_subscription(channel));
                }
                let generation = session.generation;
                drop(session);
                info!("broker asked for a new handshake");
                self.wake.notify_waiters();
                self.spawn_handshake(generation);
            }
            Some(Reconnect::None) => {
                if session.poller.take().is_some() {
                    info!("broker advised to stop polling");
                }
            }
            Some(Reconnect::Retry) | None => {
                if session.state == ConnectorState::Connected && session.poller.is_none() {
                    session.next_poller += 1;
                    let token = session.next_poller;
                    session.poller = Some(token);
                    drop(session);
                    self.spawn_poll(generation, token);
                }
            }
        }
    }
}
