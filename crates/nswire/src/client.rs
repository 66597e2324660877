//! Client-side connection wrapper.
//!
//! The core stays transport-agnostic: a [`ClientBuilder`] takes an
//! already-established transport from an adapter (such as the WebSocket
//! dialer) and runs it as the dialing side of a connection.

use std::sync::Arc;

use tracing::debug;

use crate::config::ConnConfig;
use crate::conn::{Conn, ConnHooks};
use crate::error::Error;
use crate::events::Namespaces;
use crate::namespace::NsConn;
use crate::transport::Transport;

/// Configures and dials a [`Client`].
pub struct ClientBuilder {
    namespaces: Namespaces,
    config: ConnConfig,
    hooks: ConnHooks,
}

impl ClientBuilder {
    /// Start building a client around a namespace template.
    pub fn new(namespaces: Namespaces) -> Self {
        Self {
            namespaces,
            config: ConnConfig::default(),
            hooks: ConnHooks::default(),
        }
    }

    /// Override the default connection configuration.
    #[must_use]
    pub fn config(mut self, config: ConnConfig) -> Self {
        self.config = config;
        self
    }

    /// Install a per-error veto; return `true` to keep the connection alive.
    #[must_use]
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Conn>, &Error) -> bool + Send + Sync + 'static,
    {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }

    /// Run a callback once, when the connection's close cascade completes.
    #[must_use]
    pub fn on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&Conn) + Send + 'static,
    {
        self.hooks.on_disconnect = Some(Box::new(hook));
        self
    }

    /// Run `transport` as the dialing side of a connection.
    pub fn dial(self, transport: Box<dyn Transport>) -> Client {
        let conn = Conn::new(Arc::new(self.namespaces), self.config, self.hooks);
        conn.start(transport);
        debug!(conn_id = %conn.id(), "client connection started");
        Client { conn }
    }
}

/// The dialing side of a connection.
pub struct Client {
    conn: Arc<Conn>,
}

impl Client {
    /// The underlying physical connection.
    pub fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    /// Join `namespace`, performing the connect handshake with the server.
    pub async fn connect(&self, namespace: &str) -> Result<Arc<NsConn>, Error> {
        self.conn.connect(namespace).await
    }

    /// Look up an already-joined namespace.
    pub fn namespace(&self, name: &str) -> Option<Arc<NsConn>> {
        self.conn.namespace(name)
    }

    /// Whether the connection's close cascade has started.
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Disconnect every joined namespace, then close the connection.
    ///
    /// Namespace disconnects are best effort; the connection closes either
    /// way.
    pub async fn close(&self) {
        for ns in self.conn.namespace_conns() {
            if let Err(err) = ns.disconnect().await {
                debug!(namespace = %ns.namespace(), error = %err, "disconnect during close");
            }
        }
        self.conn.close().await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("conn", &self.conn).finish()
    }
}
