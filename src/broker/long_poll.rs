//! Holding a parked `/meta/connect` open.
//!
//! [`hold`] owns the waiter for as long as the HTTP request lives. It ends in
//! one of three ways:
//! - a publish fires the waiter: the flushed batch is returned;
//! - the poll timeout elapses: the waiter is released under the broker lock
//!   and the (normally bare) connect acknowledgement is returned;
//! - the future is dropped because the connection closed: the guard releases
//!   the waiter, and a batch that was already handed over goes back to the
//!   client's queue.

use std::time::Duration;

use tracing::debug;

use crate::broker::message::Message;
use crate::broker::{SharedBroker, lock};
use crate::client::PendingConnect;

pub async fn hold(broker: SharedBroker, pending: PendingConnect, timeout: Duration) -> Vec<Message> {
    let mut held = HeldConnect {
        broker,
        pending,
        settled: false,
    };
    held.wait(timeout).await
}

struct HeldConnect {
    broker: SharedBroker,
    pending: PendingConnect,
    settled: bool,
}

impl HeldConnect {
    async fn wait(&mut self, timeout: Duration) -> Vec<Message> {
        let woken = tokio::time::timeout(timeout, &mut self.pending.rx).await;
        self.settled = true;

        match woken {
            Ok(Ok(batch)) => batch,
            Ok(Err(_)) => vec![self.pending.ack.clone()],
            Err(_) => {
                debug!(client_id = %self.pending.client_id, "long-poll timed out");
                lock(&self.broker).settle(&mut self.pending)
            }
        }
    }
}

impl Drop for HeldConnect {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        debug!(client_id = %self.pending.client_id, "long-poll aborted");
        lock(&self.broker).abandon(&mut self.pending);
    }
}
