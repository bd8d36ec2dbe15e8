// src/domain/message.rs

//! Message and address types.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::CorrelationId;

/// Content type stamped on every message produced by the bridge.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A queue address.
///
/// Addresses name the broker-side queue a message is delivered to. They are
/// immutable, cheap to clone, and compared by exact string value.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Address(pub Arc<str>);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        Address(value.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The unit exchanged with the broker.
///
/// A message is addressed to a queue and carries a routing key used by the
/// dispatcher to select a handler. Request messages carry a correlation id
/// and a reply-to address; reply messages carry the correlation id of the
/// request they answer and, when the handler failed, a failure reason.
///
/// Messages are immutable once constructed: fields are private and only
/// exposed through accessors.
///
/// # Examples
///
/// ```
/// # use mom_bridge::{Address, CorrelationId, Message};
/// # use bytes::Bytes;
/// let id = CorrelationId::generate();
/// let request = Message::request(
///     Address::from("main_queue"),
///     "message_print",
///     Bytes::from_static(br#"{"text":"hello"}"#),
///     id.clone(),
///     Address::from("main_queue.reply.node-1"),
/// );
/// assert!(request.expects_reply());
///
/// let reply = Message::reply_ok(&request, Bytes::from_static(b"\"ok\"")).unwrap();
/// assert_eq!(reply.correlation_id(), Some(&id));
/// assert_eq!(reply.address().as_str(), "main_queue.reply.node-1");
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    // ---
    address: Address,
    routing_key: Arc<str>,
    payload: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<Arc<str>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<Arc<str>>,
}

impl Message {
    /// Fire-and-forget message: no correlation id, no reply-to.
    pub fn event(address: Address, routing_key: impl Into<Arc<str>>, payload: Bytes) -> Self {
        // ---
        Self {
            address,
            routing_key: routing_key.into(),
            payload,
            correlation_id: None,
            reply_to: None,
            failure: None,
            content_type: Some(Arc::from(CONTENT_TYPE_JSON)),
        }
    }

    /// Request message expecting a reply on `reply_to`.
    pub fn request(
        address: Address,
        routing_key: impl Into<Arc<str>>,
        payload: Bytes,
        correlation_id: CorrelationId,
        reply_to: Address,
    ) -> Self {
        // ---
        Self {
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            ..Self::event(address, routing_key, payload)
        }
    }

    /// Successful reply to `request`.
    ///
    /// Returns `None` when the request does not expect a reply.
    pub fn reply_ok(request: &Message, payload: Bytes) -> Option<Self> {
        Self::reply(request, payload, None)
    }

    /// Failure-marked reply to `request`.
    ///
    /// Returns `None` when the request does not expect a reply.
    pub fn reply_err(request: &Message, reason: impl Into<Arc<str>>) -> Option<Self> {
        Self::reply(request, Bytes::new(), Some(reason.into()))
    }

    fn reply(request: &Message, payload: Bytes, failure: Option<Arc<str>>) -> Option<Self> {
        // ---
        let reply_to = request.reply_to.clone()?;
        let correlation_id = request.correlation_id.clone()?;

        Some(Self {
            address: reply_to,
            routing_key: request.routing_key.clone(),
            payload,
            correlation_id: Some(correlation_id),
            reply_to: None,
            failure,
            content_type: request.content_type.clone(),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn reply_to(&self) -> Option<&Address> {
        self.reply_to.as_ref()
    }

    /// Failure reason of a failure-marked reply.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// True when the sender waits for a reply (reply-to and correlation id set).
    pub fn expects_reply(&self) -> bool {
        self.reply_to.is_some() && self.correlation_id.is_some()
    }

    /// Consume the message and return its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
