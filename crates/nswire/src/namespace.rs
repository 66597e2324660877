//! Namespace connections.
//!
//! An [`NsConn`] is one logical sub-channel multiplexed over a physical
//! [`Conn`](crate::conn::Conn): it owns a bound copy of the namespace's
//! event table, the lifecycle state machine, and the registry of pending
//! `ask` waits keyed by correlation token.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::conn::Conn;
use crate::error::Error;
use crate::events::Events;
use crate::message::{Message, ON_NAMESPACE_DISCONNECT};
use crate::metrics_names;

/// Lifecycle state of a namespace connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamespaceState {
    /// Handshake in flight; not yet usable for application traffic.
    Connecting,
    /// Fully connected.
    Connected,
    /// Terminal. Every operation afterwards returns [`Error::Closed`].
    Disconnected,
}

/// One namespace bound to one physical connection.
pub struct NsConn {
    conn: Arc<Conn>,
    namespace: String,
    events: Events,
    state: Mutex<NamespaceState>,
    waits: DashMap<u64, oneshot::Sender<Message>>,
    torn: AtomicBool,
}

impl NsConn {
    pub(crate) fn new(conn: Arc<Conn>, namespace: String, events: Events) -> Arc<Self> {
        Arc::new(Self {
            conn,
            namespace,
            events,
            state: Mutex::new(NamespaceState::Connecting),
            waits: DashMap::new(),
            torn: AtomicBool::new(false),
        })
    }

    /// The owning physical connection.
    pub fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    /// The namespace name this sub-channel is bound to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NamespaceState {
        *self.state.lock()
    }

    /// Whether the namespace is fully connected.
    pub fn is_connected(&self) -> bool {
        self.state() == NamespaceState::Connected
    }

    pub(crate) fn set_connected(&self) {
        *self.state.lock() = NamespaceState::Connected;
    }

    /// Send a fire-and-forget event.
    ///
    /// Returns once the connection's write queue accepts the frame; there is
    /// no delivery confirmation. Frames from concurrent emitters never
    /// interleave — the connection serializes all writes.
    pub async fn emit(&self, event: &str, body: Vec<u8>) -> Result<(), Error> {
        if self.state() == NamespaceState::Disconnected {
            return Err(Error::Closed);
        }
        self.conn
            .send(Message::event(self.namespace.clone(), event, body))
            .await
    }

    /// Send a correlated request and wait for its reply.
    ///
    /// A fresh connection-unique token is registered before the frame goes
    /// out; the call resolves with the matching reply, fails with
    /// [`Error::Timeout`] after `timeout` (the connection default when
    /// `None`), or fails with [`Error::Closed`] when the namespace
    /// disconnects first. Whichever happens first removes the registration,
    /// so a late reply is discarded as an orphan.
    pub async fn ask(
        &self,
        event: &str,
        body: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Message, Error> {
        if self.state() == NamespaceState::Disconnected {
            return Err(Error::Closed);
        }

        let token = self.conn.next_token();
        let (tx, rx) = oneshot::channel();
        let _ = self.waits.insert(token, tx);

        // Teardown may have drained the registry between the state check
        // and the insert; re-check so the failure classifies as a
        // disconnect, not a timeout.
        if self.state() == NamespaceState::Disconnected {
            let _ = self.waits.remove(&token);
            return Err(Error::Closed);
        }

        let request = Message::ask(self.namespace.clone(), event, body, token);
        if let Err(err) = self.conn.send(request).await {
            let _ = self.waits.remove(&token);
            return Err(err);
        }

        let wait = timeout.unwrap_or(self.conn.config().ask_timeout);
        let reply = match tokio::time::timeout(wait, rx).await {
            Ok(Ok(reply)) => reply,
            // Sender dropped: the namespace disconnected and drained waits.
            Ok(Err(_)) => return Err(Error::Closed),
            Err(_) => {
                let _ = self.waits.remove(&token);
                return Err(Error::Timeout { after: wait });
            }
        };

        match reply.err {
            Some(message) => Err(Error::Remote { message }),
            None => Ok(reply),
        }
    }

    /// Reply to an incoming correlated request.
    ///
    /// Reuses the request's namespace, event, and token with the new body.
    /// Calling this for a message that is not a request is a programming
    /// error and returns [`Error::InvalidReply`].
    pub async fn reply(&self, request: &Message, body: Vec<u8>) -> Result<(), Error> {
        if !request.is_request() {
            return Err(Error::InvalidReply);
        }
        self.conn.send(Message::reply_to(request, body)).await
    }

    /// Reply to an incoming request with an error payload instead of a body.
    pub async fn reply_err(&self, request: &Message, err: &str) -> Result<(), Error> {
        if !request.is_request() {
            return Err(Error::InvalidReply);
        }
        self.conn
            .send(Message::reply_to(request, Vec::new()).with_err(err))
            .await
    }

    /// Disconnect this namespace.
    ///
    /// Notifies the peer, fails every pending `ask` with a disconnect error,
    /// fires the local disconnect handler, and removes the namespace from
    /// the owning connection. Calling it again returns [`Error::Closed`].
    pub async fn disconnect(self: &Arc<Self>) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            if *state == NamespaceState::Disconnected {
                return Err(Error::Closed);
            }
            *state = NamespaceState::Disconnected;
        }

        let notice = Message::event(self.namespace.clone(), ON_NAMESPACE_DISCONNECT, Vec::new());
        // Best effort: the connection itself may already be gone.
        if let Err(err) = self.conn.send(notice).await {
            debug!(namespace = %self.namespace, error = %err, "disconnect notice not sent");
        }

        let _ = self.conn.remove_namespace(&self.namespace);
        self.teardown(true).await;
        Ok(())
    }

    /// Register a wait slot for an externally driven request, such as the
    /// namespace-connect handshake.
    pub(crate) fn register_wait(&self, token: u64, tx: oneshot::Sender<Message>) {
        let _ = self.waits.insert(token, tx);
    }

    /// Route an incoming reply to its pending `ask`, if still registered.
    pub(crate) fn resolve_wait(&self, reply: Message) {
        let Some(token) = reply.token else {
            debug!(namespace = %self.namespace, "reply without token discarded");
            return;
        };
        match self.waits.remove(&token) {
            Some((_, tx)) => {
                // The receiver may have timed out between removal and here;
                // either way the slot is resolved exactly once.
                let _ = tx.send(reply);
            }
            None => {
                counter!(metrics_names::ORPHAN_REPLIES_TOTAL).increment(1);
                debug!(namespace = %self.namespace, token, "orphan reply discarded");
            }
        }
    }

    /// Dispatch an incoming message through the bound event table.
    pub(crate) async fn dispatch(self: &Arc<Self>, msg: Message) -> Result<(), Error> {
        self.events.fire(self, msg).await
    }

    /// Fire a synthetic system event (connect/connected/disconnect) through
    /// the bound table.
    pub(crate) async fn fire_system_event(self: &Arc<Self>, event: &str) -> Result<(), Error> {
        let msg = Message::event(self.namespace.clone(), event, Vec::new());
        self.events.fire(self, msg).await
    }

    /// Terminal teardown: mark disconnected, fail outstanding waits, and
    /// optionally fire the disconnect handler. Runs at most once no matter
    /// how many paths (local disconnect, remote disconnect, connection
    /// close) race into it.
    pub(crate) async fn teardown(self: &Arc<Self>, fire_handler: bool) {
        if self.torn.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = NamespaceState::Disconnected;

        // Dropping the senders resolves every pending ask with Error::Closed.
        let pending: Vec<u64> = self.waits.iter().map(|entry| *entry.key()).collect();
        for token in pending {
            let _ = self.waits.remove(&token);
        }

        if fire_handler {
            if let Err(err) = self.fire_system_event(ON_NAMESPACE_DISCONNECT).await {
                warn!(
                    namespace = %self.namespace,
                    error = %err,
                    "disconnect handler failed"
                );
            }
        }
    }
}

impl std::fmt::Debug for NsConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NsConn")
            .field("namespace", &self.namespace)
            .field("state", &self.state())
            .field("pending_waits", &self.waits.len())
            .finish()
    }
}
