//! How a connector moves a batch of messages to the broker and back.
//!
//! [`Transport`] is the seam between the connector state machine and the
//! network. [`HttpTransport`] speaks the Bayeux HTTP binding with reqwest:
//! `long-polling` posts the batch as the form field `message`, while
//! `callback-polling` issues a GET carrying `message` and `jsonp` and unwraps
//! the `callback([...]);` body.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::trace;
use url::Url;

use crate::broker::message::{ConnectionType, Message};
use crate::config::ConnectorSettings;
use crate::utils::TransportError;

/// Callback name used for `callback-polling` requests.
pub const JSONP_CALLBACK: &str = "bayeuxCallback";

pub trait Transport: Send + Sync + 'static {
    /// Sends one exchange and returns the messages the broker answered with.
    fn send(&self, batch: Vec<Message>) -> BoxFuture<'_, Result<Vec<Message>, TransportError>>;

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::LongPolling
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
    connection_type: ConnectionType,
}

impl HttpTransport {
    pub fn new(
        url: &str,
        connection_type: ConnectionType,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            url: Url::parse(url)?,
            connection_type,
        })
    }

    pub fn from_settings(settings: &ConnectorSettings) -> Result<Self, TransportError> {
        Self::new(
            &settings.url,
            settings.connection_type,
            Duration::from_secs(settings.request_timeout_secs),
        )
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Transport for HttpTransport {
    fn send(&self, batch: Vec<Message>) -> BoxFuture<'_, Result<Vec<Message>, TransportError>> {
        async move {
            let body = serde_json::to_string(&batch)?;
            trace!(url = %self.url, body = %body, "sending exchange");

            let request = match self.connection_type {
                ConnectionType::LongPolling => self
                    .client
                    .post(self.url.clone())
                    .form(&[("message", body.as_str())]),
                ConnectionType::CallbackPolling => self
                    .client
                    .get(self.url.clone())
                    .query(&[("message", body.as_str()), ("jsonp", JSONP_CALLBACK)]),
            };

            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Status(status.as_u16()));
            }

            let text = response.text().await?;
            let json = match self.connection_type {
                ConnectionType::LongPolling => text.as_str(),
                ConnectionType::CallbackPolling => unwrap_jsonp(&text, JSONP_CALLBACK)?,
            };
            Ok(serde_json::from_str(json)?)
        }
        .boxed()
    }

    fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }
}

/// Extracts the JSON argument from a `callback(<json>);` body.
pub fn unwrap_jsonp<'a>(body: &'a str, callback: &str) -> Result<&'a str, TransportError> {
    let body = body.trim();
    let body = body.strip_suffix(';').unwrap_or(body);
    body.strip_prefix(callback)
        .and_then(|rest| rest.strip_prefix('('))
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or(TransportError::Jsonp)
}
