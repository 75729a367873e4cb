//! Client representation
//!
//! `Client` models one handshaken Bayeux client: the messages waiting to be
//! delivered and at most one parked long-poll (`Waiter`). The waiter holds
//! the sending half of a oneshot; firing it moves the sender out of the slot,
//! so a waiter can be satisfied exactly once.

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::broker::message::{META_CONNECT, Message};

/// A registered long-poll: the connect acknowledgement to append when it
/// fires, and where to send the flushed batch.
#[derive(Debug)]
pub struct Waiter {
    id: u64,
    ack: Message,
    tx: oneshot::Sender<Vec<Message>>,
}

/// The receiving side of a parked connect, handed to whoever holds the HTTP
/// request open.
#[derive(Debug)]
pub struct PendingConnect {
    pub client_id: String,
    pub waiter_id: u64,
    /// Bare acknowledgement, used when the poll ends without a wakeup.
    pub ack: Message,
    pub(crate) rx: oneshot::Receiver<Vec<Message>>,
}

#[derive(Debug)]
pub struct Client {
    pub id: String,
    /// Set once the client has issued a connect.
    pub connected: bool,
    /// Milliseconds since the UNIX epoch of the last request from this client.
    pub last_seen: i64,
    queue: VecDeque<Message>,
    waiter: Option<Waiter>,
    next_waiter_id: u64,
}

impl Client {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connected: false,
            last_seen: chrono::Utc::now().timestamp_millis(),
            queue: VecDeque::new(),
            waiter: None,
            next_waiter_id: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = chrono::Utc::now().timestamp_millis();
    }

    pub fn queued(&self) -> impl Iterator<Item = &Message> {
        self.queue.iter()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn has_waiter(&self) -> bool {
        self.waiter.is_some()
    }

    /// Append a message for delivery. A registered waiter is fired in the
    /// same step, so a message can never land between "queue found empty"
    /// and "waiter registered".
    pub fn push(&mut self, message: Message) {
        self.queue.push_back(message);
        if let Some(waiter) = self.waiter.take() {
            self.fire(waiter);
        }
    }

    /// Drain the queue and append `ack`, producing a connect response.
    pub fn flush(&mut self, ack: Message) -> Vec<Message> {
        let mut batch: Vec<Message> = self.queue.drain(..).collect();
        batch.push(ack);
        batch
    }

    /// Park a long-poll. Any previous waiter must have been resolved first.
    pub fn wait(&mut self, ack: Message) -> PendingConnect {
        debug_assert!(self.waiter.is_none());

        self.next_waiter_id += 1;
        let (tx, rx) = oneshot::channel();
        self.waiter = Some(Waiter {
            id: self.next_waiter_id,
            ack: ack.clone(),
            tx,
        });

        PendingConnect {
            client_id: self.id.clone(),
            waiter_id: self.next_waiter_id,
            ack,
            rx,
        }
    }

    /// Resolve the current waiter, if any, with its bare acknowledgement. The
    /// queue is left for the next connect.
    pub fn cancel_waiter(&mut self) -> bool {
        match self.waiter.take() {
            Some(waiter) => {
                let _ = waiter.tx.send(vec![waiter.ack]);
                true
            }
            None => false,
        }
    }

    /// Take waiter `waiter_id` out of the slot and flush the queue for it.
    /// Returns `None` if that waiter has already fired or been replaced.
    pub fn release_waiter(&mut self, waiter_id: u64) -> Option<Vec<Message>> {
        if self.waiter.as_ref().map(|w| w.id) != Some(waiter_id) {
            return None;
        }
        let waiter = self.waiter.take()?;
        Some(self.flush(waiter.ack))
    }

    /// Put an undelivered batch back at the head of the queue, dropping the
    /// connect acknowledgements it carried.
    pub fn requeue_front(&mut self, batch: Vec<Message>) {
        for message in batch
            .into_iter()
            .rev()
            .filter(|m| m.channel != META_CONNECT)
        {
            self.queue.push_front(message);
        }
    }

    fn fire(&mut self, waiter: Waiter) {
        let batch = self.flush(waiter.ack);
        if let Err(batch) = waiter.tx.send(batch) {
            // the held request is gone; keep the messages for the next poll
            self.requeue_front(batch);
        }
    }
}
