//! Connection registry and broadcast.
//!
//! A [`Server`] accepts already-established transports, runs each as a
//! [`Conn`], and tracks them in a registry so events can be broadcast to
//! every peer connected to a namespace. The server never owns a listener;
//! the embedding layer (a WebSocket upgrade handler, a TCP accept loop)
//! hands transports in.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use futures::future::BoxFuture;
use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ConnConfig;
use crate::conn::{Conn, ConnHooks, ConnId, ErrorHook};
use crate::error::Error;
use crate::events::Namespaces;
use crate::message::Message;
use crate::metrics_names;
use crate::transport::Transport;

type ConnectHook = Arc<dyn Fn(Arc<Conn>) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Accepts transports and tracks the resulting connections.
pub struct Server {
    namespaces: Arc<Namespaces>,
    config: ConnConfig,
    registry: DashMap<ConnId, Arc<Conn>>,
    on_connect: Mutex<Option<ConnectHook>>,
    on_error: Mutex<Option<ErrorHook>>,
    auto_connect: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl Server {
    /// Create a server around a namespace template.
    pub fn new(namespaces: Namespaces, config: ConnConfig) -> Arc<Self> {
        Arc::new(Self {
            namespaces: Arc::new(namespaces),
            config,
            registry: DashMap::new(),
            on_connect: Mutex::new(None),
            on_error: Mutex::new(None),
            auto_connect: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Install a hook that runs after each accepted connection starts.
    ///
    /// A non-`Ok` return closes the connection and fails the accept.
    pub fn set_on_connect<F, Fut>(&self, hook: F)
    where
        F: Fn(Arc<Conn>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        *self.on_connect.lock() = Some(Arc::new(move |conn| Box::pin(hook(conn))));
    }

    /// Install a per-error veto for accepted connections.
    ///
    /// Return `true` to keep the connection alive despite the error.
    pub fn set_on_error<F>(&self, hook: F)
    where
        F: Fn(&Arc<Conn>, &Error) -> bool + Send + Sync + 'static,
    {
        *self.on_error.lock() = Some(Arc::new(hook));
    }

    /// Namespaces the server joins on each connection right after accepting
    /// it, instead of waiting for the peer to initiate.
    pub fn set_auto_connect<I, S>(&self, namespaces: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.auto_connect.lock() = namespaces.into_iter().map(Into::into).collect();
    }

    /// Run `transport` as a connection owned by this server.
    ///
    /// The connection is registered before its tasks start, so a peer that
    /// disconnects immediately still leaves the registry clean.
    pub async fn accept(
        self: &Arc<Self>,
        transport: Box<dyn Transport>,
    ) -> Result<Arc<Conn>, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let registry_server = Arc::downgrade(self);
        let hooks = ConnHooks {
            on_error: self.on_error.lock().clone(),
            on_disconnect: Some(Box::new(move |conn: &Conn| {
                if let Some(server) = registry_server.upgrade() {
                    let _ = server.registry.remove(conn.id());
                }
            })),
        };
        let conn = Conn::new(Arc::clone(&self.namespaces), self.config.clone(), hooks);
        conn.set_server(Arc::downgrade(self));
        let _ = self.registry.insert(conn.id().clone(), Arc::clone(&conn));
        conn.start(transport);
        debug!(conn_id = %conn.id(), "connection accepted");

        let on_connect = self.on_connect.lock().clone();
        if let Some(hook) = on_connect {
            if let Err(err) = hook(Arc::clone(&conn)).await {
                warn!(conn_id = %conn.id(), error = %err, "connect hook rejected connection");
                conn.close().await;
                return Err(err);
            }
        }

        let auto = self.auto_connect.lock().clone();
        for namespace in auto {
            if let Err(err) = conn.connect(&namespace).await {
                warn!(
                    conn_id = %conn.id(),
                    namespace = %namespace,
                    error = %err,
                    "auto-connect failed"
                );
                conn.close().await;
                return Err(err);
            }
        }

        Ok(conn)
    }

    /// Send `event` to every connection joined to `namespace`.
    ///
    /// Never waits on any peer: the message is encoded once and queued with
    /// `try_send`; a peer with a full queue loses this frame, and a peer
    /// that exceeds its lifetime drop budget is closed. Returns the number
    /// of peers the frame was queued for.
    pub async fn broadcast(
        &self,
        namespace: &str,
        event: &str,
        body: Vec<u8>,
    ) -> Result<usize, Error> {
        self.broadcast_inner(namespace, event, body, None).await
    }

    /// [`broadcast`](Self::broadcast), skipping one connection — typically
    /// the originator of the event.
    pub async fn broadcast_except(
        &self,
        namespace: &str,
        event: &str,
        body: Vec<u8>,
        skip: &ConnId,
    ) -> Result<usize, Error> {
        self.broadcast_inner(namespace, event, body, Some(skip)).await
    }

    async fn broadcast_inner(
        &self,
        namespace: &str,
        event: &str,
        body: Vec<u8>,
        skip: Option<&ConnId>,
    ) -> Result<usize, Error> {
        let frame = Message::event(namespace, event, body).encode()?;

        // Snapshot the registry; closing a slow peer mutates it through the
        // disconnect hook, which must not run under the iterator.
        let conns: Vec<Arc<Conn>> = self
            .registry
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut delivered = 0usize;
        let mut slow: Vec<Arc<Conn>> = Vec::new();
        for conn in conns {
            if skip.is_some_and(|id| id == conn.id()) {
                continue;
            }
            let Some(ns) = conn.namespace(namespace) else {
                continue;
            };
            if !ns.is_connected() {
                continue;
            }
            if conn.try_send_frame(frame.clone()) {
                delivered += 1;
            } else {
                counter!(metrics_names::BROADCAST_DROPS_TOTAL).increment(1);
                if conn.dropped_frames() > self.config.max_drops {
                    slow.push(conn);
                }
            }
        }

        for conn in slow {
            counter!(metrics_names::SLOW_PEER_CLOSES_TOTAL).increment(1);
            warn!(
                conn_id = %conn.id(),
                dropped = conn.dropped_frames(),
                "closing peer that exhausted its drop budget"
            );
            conn.close().await;
        }

        Ok(delivered)
    }

    /// Look up a live connection by id.
    pub fn get_conn(&self, id: &ConnId) -> Option<Arc<Conn>> {
        self.registry.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of currently registered connections.
    pub fn total_connections(&self) -> usize {
        self.registry.len()
    }

    /// Ids of every currently registered connection.
    pub fn conn_ids(&self) -> Vec<ConnId> {
        self.registry.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Stop accepting and close every registered connection.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let conns: Vec<Arc<Conn>> = self
            .registry
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for conn in conns {
            conn.close().await;
        }
        self.registry.clear();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("namespaces", &self.namespaces)
            .field("connections", &self.registry.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
