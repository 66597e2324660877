//! Physical connections.
//!
//! A [`Conn`] owns one transport, one reader task, one writer task, and the
//! set of namespace connections multiplexed over it. Handlers run inside
//! the reader task, so a slow handler delays further messages for its own
//! connection only; this buys strict per-connection ordering at the cost of
//! per-connection throughput.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ConnConfig;
use crate::error::Error;
use crate::events::Namespaces;
use crate::message::{
    Message, MessageKind, ON_NAMESPACE_CONNECT, ON_NAMESPACE_CONNECTED, ON_NAMESPACE_DISCONNECT,
    ON_NATIVE_MESSAGE,
};
use crate::metrics_names;
use crate::namespace::{NamespaceState, NsConn};
use crate::server::Server;
use crate::transport::{Transport, TransportReader, TransportWriter};

/// Unique connection identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnId(String);

impl ConnId {
    fn generate() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-error veto: return `true` to keep the connection alive.
pub(crate) type ErrorHook = Arc<dyn Fn(&Arc<Conn>, &Error) -> bool + Send + Sync>;
/// Runs exactly once when the connection's close cascade completes.
pub(crate) type DisconnectHook = Box<dyn FnOnce(&Conn) + Send>;

/// Hooks wired in by the owner (server or client) before the tasks start.
#[derive(Default)]
pub(crate) struct ConnHooks {
    pub on_error: Option<ErrorHook>,
    pub on_disconnect: Option<DisconnectHook>,
}

/// One physical connection and the namespaces multiplexed over it.
pub struct Conn {
    id: ConnId,
    template: Arc<Namespaces>,
    config: ConnConfig,
    namespaces: DashMap<String, Arc<NsConn>>,
    out_tx: mpsc::Sender<Bytes>,
    out_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    token_counter: AtomicU64,
    // Serializes namespace-connect handshakes so concurrent callers
    // rendezvous on one in-flight handshake.
    connect_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    cancel: CancellationToken,
    dropped_frames: AtomicU64,
    on_error: Option<ErrorHook>,
    on_disconnect: Mutex<Option<DisconnectHook>>,
    server: OnceLock<Weak<Server>>,
}

impl Conn {
    pub(crate) fn new(template: Arc<Namespaces>, config: ConnConfig, hooks: ConnHooks) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(config.send_queue.max(1));
        Arc::new(Self {
            id: ConnId::generate(),
            template,
            config,
            namespaces: DashMap::new(),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            token_counter: AtomicU64::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            dropped_frames: AtomicU64::new(0),
            on_error: hooks.on_error,
            on_disconnect: Mutex::new(hooks.on_disconnect),
            server: OnceLock::new(),
        })
    }

    /// Spawn the writer and reader tasks over `transport`. Idempotent; the
    /// second call is a no-op.
    pub(crate) fn start(self: &Arc<Self>, transport: Box<dyn Transport>) {
        let Some(mut out_rx) = self.out_rx.lock().take() else {
            return;
        };
        let (mut writer, mut reader) = transport.split();
        counter!(metrics_names::CONNECTIONS_OPENED_TOTAL).increment(1);

        // Writer: drains the outbound queue so frames from concurrent
        // senders never interleave.
        let write_timeout = self.config.write_timeout;
        let writer_cancel = self.cancel.clone();
        let writer_conn = Arc::downgrade(self);
        let _ = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_cancel.cancelled() => break,
                    frame = out_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let result = send_frame(writer.as_mut(), frame, write_timeout).await;
                        if let Err(err) = result {
                            let Some(conn) = writer_conn.upgrade() else { break };
                            // The error hook gets the same veto it has on
                            // the read path; a `true` vote drops the failed
                            // frame and keeps writing.
                            if !err.is_disconnect() {
                                warn!(conn_id = %conn.id, error = %err, "write failed");
                                if conn.report_transport_error(&err) {
                                    continue;
                                }
                            }
                            // The reader winds down and runs the cascade.
                            conn.cancel.cancel();
                            break;
                        }
                    }
                }
            }
            let _ = writer.close().await;
        });

        // Reader: the single dispatch loop for this connection.
        let conn = Arc::clone(self);
        let cancel = self.cancel.clone();
        let read_timeout = self.config.read_timeout;
        let _ = tokio::spawn(async move {
            let fatal: Option<Error> = loop {
                let frame = tokio::select! {
                    () = cancel.cancelled() => break None,
                    result = receive_frame(reader.as_mut(), read_timeout) => match result {
                        Ok(frame) => frame,
                        Err(err) => {
                            if err.is_disconnect() {
                                break None;
                            }
                            if conn.report_transport_error(&err) {
                                continue;
                            }
                            break Some(err);
                        }
                    }
                };
                match Message::decode(&frame) {
                    Ok(msg) => {
                        if let Err(err) = conn.route(msg).await {
                            if err.is_disconnect() {
                                break None;
                            }
                            break Some(err);
                        }
                    }
                    Err(err) => match conn.native_fallback(frame).await {
                        Ok(true) => {}
                        Ok(false) => {
                            counter!(metrics_names::DECODE_ERRORS_TOTAL).increment(1);
                            break Some(err);
                        }
                        Err(err) => break Some(err),
                    },
                }
            };
            if let Some(err) = &fatal {
                warn!(conn_id = %conn.id, error = %err, code = err.code(), "connection failed");
                let _ = conn.report_transport_error(err);
            }
            conn.shutdown().await;
        });
    }

    /// Unique identifier of this connection.
    pub fn id(&self) -> &ConnId {
        &self.id
    }

    /// The connection's configuration.
    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    /// Whether the close cascade has started.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The server that accepted this connection, when still alive.
    ///
    /// `None` for client-dialed connections.
    pub fn server(&self) -> Option<Arc<Server>> {
        self.server.get().and_then(Weak::upgrade)
    }

    pub(crate) fn set_server(&self, server: Weak<Server>) {
        let _ = self.server.set(server);
    }

    /// Look up an already-joined namespace.
    pub fn namespace(&self, name: &str) -> Option<Arc<NsConn>> {
        self.namespaces.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every namespace currently joined on this connection.
    pub fn namespace_conns(&self) -> Vec<Arc<NsConn>> {
        self.namespaces
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub(crate) fn remove_namespace(&self, name: &str) -> Option<Arc<NsConn>> {
        self.namespaces.remove(name).map(|(_, ns)| ns)
    }

    /// Next connection-unique correlation token.
    pub(crate) fn next_token(&self) -> u64 {
        self.token_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Lifetime count of frames dropped by the broadcast backpressure policy.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Encode and queue `msg`, waiting for queue space.
    pub(crate) async fn send(&self, msg: Message) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let frame = msg.encode()?;
        self.out_tx.send(frame).await.map_err(|_| Error::Closed)
    }

    /// Queue an already-encoded frame without waiting.
    ///
    /// Returns `false` when the queue is full or the connection is closed,
    /// incrementing the drop counter. Broadcast uses this so one slow peer
    /// cannot stall delivery to the rest.
    pub(crate) fn try_send_frame(&self, frame: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.out_tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Join `namespace`, performing the connect handshake with the peer.
    ///
    /// Both sides must have the namespace in their events template. Blocks
    /// until the namespace is fully connected or the handshake fails;
    /// concurrent callers for the same namespace share one handshake and
    /// all receive the same `NsConn`.
    pub async fn connect(self: &Arc<Self>, namespace: &str) -> Result<Arc<NsConn>, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if let Some(existing) = self.namespace(namespace) {
            if existing.is_connected() {
                return Ok(existing);
            }
        }

        // One handshake at a time; a caller that lost the race finds the
        // namespace connected on the re-check below.
        let _guard = self.connect_lock.lock().await;
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if let Some(existing) = self.namespace(namespace) {
            if existing.is_connected() {
                return Ok(existing);
            }
        }

        let events = self
            .template
            .get(namespace)
            .cloned()
            .ok_or_else(|| Error::UnknownNamespace {
                namespace: namespace.to_owned(),
            })?;

        let ns = NsConn::new(Arc::clone(self), namespace.to_owned(), events);
        // Inserted while still connecting so the reader can route the
        // handshake reply to the wait slot below.
        let _ = self
            .namespaces
            .insert(namespace.to_owned(), Arc::clone(&ns));

        // Local connect-phase handler may veto before any traffic goes out.
        if let Err(err) = ns.fire_system_event(ON_NAMESPACE_CONNECT).await {
            self.abort_handshake(namespace, &ns).await;
            return Err(Error::Handshake {
                message: err.to_string(),
            });
        }

        let token = self.next_token();
        let (tx, rx) = oneshot::channel();
        ns.register_wait(token, tx);
        let request = Message::ask(namespace, ON_NAMESPACE_CONNECT, Vec::new(), token);
        if let Err(err) = self.send(request).await {
            self.abort_handshake(namespace, &ns).await;
            return Err(err);
        }

        let wait = self.config.ask_timeout;
        let reply = match tokio::time::timeout(wait, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                self.abort_handshake(namespace, &ns).await;
                return Err(Error::Closed);
            }
            Err(_) => {
                self.abort_handshake(namespace, &ns).await;
                return Err(Error::Timeout { after: wait });
            }
        };

        if let Some(message) = reply.err {
            self.abort_handshake(namespace, &ns).await;
            return Err(Error::Handshake { message });
        }

        // The reader performed the Connected transition before resolving
        // the wait, so the namespace is ready the moment this returns.
        Ok(ns)
    }

    async fn abort_handshake(&self, namespace: &str, ns: &Arc<NsConn>) {
        let _ = self.remove_namespace(namespace);
        ns.teardown(false).await;
    }

    /// Route one decoded incoming message.
    pub(crate) async fn route(self: &Arc<Self>, msg: Message) -> Result<(), Error> {
        match msg.kind {
            MessageKind::Noop => Ok(()),
            MessageKind::Reply => {
                match self.namespace(&msg.namespace) {
                    Some(ns) => {
                        // A successful connect ack transitions the namespace
                        // here, in the reader, so the connected handler runs
                        // before any frame the peer sent after acking.
                        // Only a Connecting namespace may transition; a late
                        // ack for an already torn-down handshake is an orphan.
                        let connect_ack = msg.event == ON_NAMESPACE_CONNECT
                            && msg.err.is_none()
                            && ns.state() == NamespaceState::Connecting;
                        if connect_ack {
                            ns.set_connected();
                        }
                        ns.resolve_wait(msg);
                        if connect_ack {
                            if let Err(err) = ns.fire_system_event(ON_NAMESPACE_CONNECTED).await {
                                let _ = self.report_dispatch_error(&err);
                            }
                        }
                    }
                    None => {
                        debug!(conn_id = %self.id, namespace = %msg.namespace, "reply for unjoined namespace discarded");
                    }
                }
                Ok(())
            }
            MessageKind::Ask if msg.event == ON_NAMESPACE_CONNECT => {
                self.handle_connect_request(msg).await
            }
            MessageKind::Event if msg.event == ON_NAMESPACE_DISCONNECT => {
                if let Some((_, ns)) = self.namespaces.remove(&msg.namespace) {
                    ns.teardown(true).await;
                }
                Ok(())
            }
            MessageKind::Ask | MessageKind::Event => {
                let Some(ns) = self.namespace(&msg.namespace) else {
                    debug!(
                        conn_id = %self.id,
                        namespace = %msg.namespace,
                        event = %msg.event,
                        "message for unjoined namespace"
                    );
                    if msg.is_request() {
                        let reply = Message::reply_to(&msg, Vec::new())
                            .with_err(format!("namespace '{}' is not connected", msg.namespace));
                        return self.send(reply).await;
                    }
                    return Ok(());
                };
                match ns.dispatch(msg).await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        counter!(metrics_names::DISPATCH_ERRORS_TOTAL).increment(1);
                        if self.report_dispatch_error(&err) {
                            Ok(())
                        } else {
                            Err(err)
                        }
                    }
                }
            }
        }
    }

    /// Responder side of the namespace-connect handshake.
    async fn handle_connect_request(self: &Arc<Self>, msg: Message) -> Result<(), Error> {
        let namespace = msg.namespace.clone();

        // Already joined (or joining) from this side; just acknowledge.
        if self.namespace(&namespace).is_some() {
            return self.send(Message::reply_to(&msg, Vec::new())).await;
        }

        let Some(events) = self.template.get(&namespace).cloned() else {
            let reply = Message::reply_to(&msg, Vec::new())
                .with_err(format!("namespace '{namespace}' is not registered"));
            return self.send(reply).await;
        };

        let ns = NsConn::new(Arc::clone(self), namespace.clone(), events);
        // Connect-phase handler error aborts the handshake: the NsConn is
        // never installed and the asker gets the error as a handshake
        // failure.
        if let Err(err) = ns.fire_system_event(ON_NAMESPACE_CONNECT).await {
            debug!(conn_id = %self.id, namespace = %namespace, error = %err, "namespace connect refused");
            ns.teardown(false).await;
            let reply = Message::reply_to(&msg, Vec::new()).with_err(err.to_string());
            return self.send(reply).await;
        }

        ns.set_connected();
        let _ = self.namespaces.insert(namespace, Arc::clone(&ns));
        self.send(Message::reply_to(&msg, Vec::new())).await?;
        if let Err(err) = ns.fire_system_event(ON_NAMESPACE_CONNECTED).await {
            let _ = self.report_dispatch_error(&err);
        }
        Ok(())
    }

    /// Hand a frame that failed envelope decoding to the native-message
    /// handler, when one is registered on the empty namespace.
    async fn native_fallback(self: &Arc<Self>, frame: Bytes) -> Result<bool, Error> {
        let Some(events) = self.template.get("") else {
            return Ok(false);
        };
        if !events.has(ON_NATIVE_MESSAGE) {
            return Ok(false);
        }
        let ns = match self.namespace("") {
            Some(ns) => ns,
            None => {
                let ns = NsConn::new(Arc::clone(self), String::new(), events.clone());
                ns.set_connected();
                let _ = self.namespaces.insert(String::new(), Arc::clone(&ns));
                ns
            }
        };
        let msg = Message {
            namespace: String::new(),
            event: ON_NATIVE_MESSAGE.to_owned(),
            kind: MessageKind::Event,
            token: None,
            body: frame.to_vec(),
            err: None,
        };
        match ns.dispatch(msg).await {
            Ok(()) => Ok(true),
            Err(err) => {
                if self.report_dispatch_error(&err) {
                    Ok(true)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Notify the error hook about a transport-level error.
    ///
    /// Returns `true` to keep the connection alive; without a hook the
    /// connection closes.
    fn report_transport_error(self: &Arc<Self>, err: &Error) -> bool {
        match &self.on_error {
            Some(hook) => hook(self, err),
            None => false,
        }
    }

    /// Notify the error hook about a handler error.
    ///
    /// Handler errors are local to their dispatch: without a hook the
    /// connection stays alive; a hook may still vote to close it.
    fn report_dispatch_error(self: &Arc<Self>, err: &Error) -> bool {
        warn!(conn_id = %self.id, error = %err, "handler failed");
        match &self.on_error {
            Some(hook) => hook(self, err),
            None => true,
        }
    }

    /// Close this connection and everything multiplexed over it.
    pub async fn close(self: &Arc<Self>) {
        self.shutdown().await;
    }

    /// The close cascade. Runs exactly once regardless of which path
    /// (reader exit, writer failure, explicit close) reaches it first.
    pub(crate) async fn shutdown(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        // Drain under exclusive access so no new NsConn can form on a
        // closing connection, then tear each down outside the map.
        let nsconns = self.namespace_conns();
        self.namespaces.clear();
        for ns in nsconns {
            ns.teardown(true).await;
        }

        counter!(metrics_names::CONNECTIONS_CLOSED_TOTAL).increment(1);
        debug!(conn_id = %self.id, "connection closed");

        let hook = self.on_disconnect.lock().take();
        if let Some(hook) = hook {
            hook(self);
        }
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("namespaces", &self.namespaces.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn receive_frame(
    reader: &mut (dyn TransportReader + '_),
    deadline: Option<Duration>,
) -> Result<Bytes, Error> {
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, reader.receive()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transport {
                message: format!("read deadline {limit:?} exceeded"),
            }),
        },
        None => reader.receive().await,
    }
}

async fn send_frame(
    writer: &mut (dyn TransportWriter + '_),
    frame: Bytes,
    deadline: Option<Duration>,
) -> Result<(), Error> {
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, writer.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transport {
                message: format!("write deadline {limit:?} exceeded"),
            }),
        },
        None => writer.send(frame).await,
    }
}
