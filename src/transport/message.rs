//! Wire envelope of the HTTP binding.
//!
//! Requests carry their messages in one parameter, `message`, holding either
//! a single JSON message or an array of them. Callback-polling requests add
//! `jsonp`, the name of the function the response array is wrapped in.

use serde::Deserialize;
use serde_json::Value;

use crate::broker::message::Message;
use crate::utils::ProtocolError;

/// Form or query parameters of one exchange.
#[derive(Debug, Default, Deserialize)]
pub struct MessageParams {
    pub message: Option<String>,
    pub jsonp: Option<String>,
}

impl MessageParams {
    pub fn messages(&self) -> Result<Vec<Message>, ProtocolError> {
        let raw = self
            .message
            .as_deref()
            .ok_or(ProtocolError::MissingField("message"))?;
        parse_envelope(raw)
    }
}

pub fn parse_envelope(raw: &str) -> Result<Vec<Message>, ProtocolError> {
    let value: Value = serde_json::from_str(raw)?;
    let messages = match value {
        Value::Array(_) => serde_json::from_value(value)?,
        single => vec![serde_json::from_value(single)?],
    };
    Ok(messages)
}

/// Accepts dotted JavaScript identifier paths such as `jQuery1_2` or
/// `app.handlers.cometd`.
pub fn validate_callback(name: &str) -> Result<(), ProtocolError> {
    let valid = !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        });

    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidCallback(name.to_string()))
    }
}

pub fn render_jsonp(callback: &str, messages: &[Message]) -> Result<String, serde_json::Error> {
    Ok(format!("{callback}({});", serde_json::to_string(messages)?))
}
