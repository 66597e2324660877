//! Error taxonomy for the messaging core.

use std::time::Duration;

/// Errors surfaced by connections, namespaces, and the server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An incoming frame could not be decoded into a message envelope.
    ///
    /// Fatal to the connection that received it: the reader loop terminates
    /// and the disconnect cascade runs.
    #[error("failed to decode frame: {message}")]
    Decode {
        /// Description of the decode failure.
        message: String,
    },

    /// A message envelope could not be serialized for the wire.
    #[error("failed to encode message: {message}")]
    Encode {
        /// Description of the encode failure.
        message: String,
    },

    /// The remote side rejected a namespace-connect handshake, or a local
    /// connect-phase handler returned an error.
    ///
    /// Fails only the specific `connect` call; other namespaces on the same
    /// connection are unaffected.
    #[error("namespace connect rejected: {message}")]
    Handshake {
        /// Why the handshake was refused.
        message: String,
    },

    /// An `ask` expired before the matching reply arrived.
    ///
    /// Local to the caller; the connection stays up and a late reply is
    /// discarded as an orphan.
    #[error("ask timed out after {after:?}")]
    Timeout {
        /// How long the caller waited.
        after: Duration,
    },

    /// The connection or namespace is closed.
    ///
    /// Surfaced to every pending `ask` and to disconnect handlers during
    /// teardown. Callers distinguish it via [`Error::is_disconnect`] and
    /// treat it as expected teardown rather than a bug.
    #[error("connection closed")]
    Closed,

    /// The requested namespace is not present in the events table.
    #[error("namespace '{namespace}' is not registered")]
    UnknownNamespace {
        /// The namespace that was asked for.
        namespace: String,
    },

    /// `reply` was called for a message that is not a correlated request.
    #[error("message does not carry a correlation token")]
    InvalidReply,

    /// Read/write failure or deadline exceeded on the underlying transport.
    ///
    /// Routed to the `on_error` hook; unless the hook votes to keep the
    /// connection alive, the connection is closed.
    #[error("transport: {message}")]
    Transport {
        /// Underlying I/O description.
        message: String,
    },

    /// The remote peer answered an `ask` with an error payload.
    #[error("remote error: {message}")]
    Remote {
        /// The error text carried by the reply envelope.
        message: String,
    },
}

impl Error {
    /// Whether this error means the connection or namespace went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether this error is local to a single `ask` call.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Machine-readable code for this variant, for logs and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Decode { .. } => "decode",
            Self::Encode { .. } => "encode",
            Self::Handshake { .. } => "handshake",
            Self::Timeout { .. } => "timeout",
            Self::Closed => "closed",
            Self::UnknownNamespace { .. } => "unknown_namespace",
            Self::InvalidReply => "invalid_reply",
            Self::Transport { .. } => "transport",
            Self::Remote { .. } => "remote",
        }
    }
}

/// Whether `err` is an expected-teardown disconnect error.
///
/// Lets application code ignore the errors that every closing connection
/// produces while still logging real failures.
pub fn is_disconnect_error(err: &Error) -> bool {
    err.is_disconnect()
}
