//! Message envelope and wire codec.
//!
//! One transport frame carries exactly one JSON-encoded [`Message`]. The
//! `kind` field is the explicit discriminator between one-way events,
//! correlated requests, their replies, and token-only no-ops; the reserved
//! system event names below are matched case-sensitively on `event`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Fired while a namespace-connect handshake is in flight; an error return
/// aborts the handshake.
pub const ON_NAMESPACE_CONNECT: &str = "_OnNamespaceConnect";
/// Fired once a namespace has fully transitioned to connected.
pub const ON_NAMESPACE_CONNECTED: &str = "_OnNamespaceConnected";
/// Fired when a namespace disconnects, locally or remotely.
pub const ON_NAMESPACE_DISCONNECT: &str = "_OnNamespaceDisconnect";
/// Catch-all handler invoked for events with no specific handler.
pub const ON_ANY_EVENT: &str = "_OnAnyEvent";
/// Receives raw frames that are not valid message envelopes, when registered
/// on the empty namespace.
pub const ON_NATIVE_MESSAGE: &str = "_OnNativeMessage";

/// Whether `event` is one of the reserved lifecycle event names.
///
/// Useful inside an [`ON_ANY_EVENT`] handler that only wants application
/// events.
pub fn is_system_event(event: &str) -> bool {
    matches!(
        event,
        ON_NAMESPACE_CONNECT
            | ON_NAMESPACE_CONNECTED
            | ON_NAMESPACE_DISCONNECT
            | ON_NATIVE_MESSAGE
    )
}

/// Wire discriminator for a [`Message`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Fire-and-forget event; expects no reply.
    Event,
    /// Correlated request; expects exactly one reply bearing the same token.
    Ask,
    /// Reply satisfying a prior ask; never expects a further reply.
    Reply,
    /// Carries only a correlation token, with no handler invocation.
    Noop,
}

/// The logical envelope carried by one transport frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Target namespace. Empty only before a namespace handshake completes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Event name within the namespace; may be a reserved system event.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
    /// Envelope discriminator.
    pub kind: MessageKind,
    /// Correlation token; present on asks, their replies, and no-ops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<u64>,
    /// Opaque payload, base64 on the wire.
    #[serde(default, with = "body_base64", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
    /// Error text; mutually exclusive with a successful body on replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl Message {
    /// Build a one-way event message.
    pub fn event(namespace: impl Into<String>, event: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            namespace: namespace.into(),
            event: event.into(),
            kind: MessageKind::Event,
            token: None,
            body,
            err: None,
        }
    }

    /// Build a correlated request carrying `token`.
    pub(crate) fn ask(
        namespace: impl Into<String>,
        event: impl Into<String>,
        body: Vec<u8>,
        token: u64,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            event: event.into(),
            kind: MessageKind::Ask,
            token: Some(token),
            body,
            err: None,
        }
    }

    /// Build the reply to `request`, reusing its namespace, event, and token.
    pub(crate) fn reply_to(request: &Message, body: Vec<u8>) -> Self {
        Self {
            namespace: request.namespace.clone(),
            event: request.event.clone(),
            kind: MessageKind::Reply,
            token: request.token,
            body,
            err: None,
        }
    }

    /// Attach an error payload, clearing any body.
    pub(crate) fn with_err(mut self, err: impl Into<String>) -> Self {
        self.err = Some(err.into());
        self.body = Vec::new();
        self
    }

    /// Whether this message is a request that expects exactly one reply.
    pub fn is_request(&self) -> bool {
        self.kind == MessageKind::Ask && self.token.is_some()
    }

    /// Serialize this message into a single wire frame.
    pub fn encode(&self) -> Result<Bytes, Error> {
        let vec = serde_json::to_vec(self).map_err(|e| Error::Encode {
            message: e.to_string(),
        })?;
        Ok(Bytes::from(vec))
    }

    /// Parse one wire frame back into a message.
    ///
    /// Malformed or truncated input yields [`Error::Decode`], which the
    /// connection reader treats as fatal.
    pub fn decode(frame: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(frame).map_err(|e| Error::Decode {
            message: e.to_string(),
        })
    }
}

mod body_base64 {
    use super::{BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
