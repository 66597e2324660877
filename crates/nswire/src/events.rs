//! Event routing tables.
//!
//! [`Events`] maps event names to handlers inside one namespace;
//! [`Namespaces`] maps namespace names to their event tables. A server or
//! client is configured with a `Namespaces` template, and every namespace
//! connection receives its own bound copy at creation, so handler lookup
//! during dispatch is read-only and safe under concurrency.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::message::{Message, ON_ANY_EVENT};
use crate::namespace::NsConn;

/// Handler invoked for one event on one namespace connection.
///
/// Implemented automatically for `async` closures of the shape
/// `|ns: Arc<NsConn>, msg: Message| async move { .. }`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle `msg` arriving on `ns`.
    ///
    /// A non-`Ok` return from a connect-phase handler aborts the namespace
    /// handshake; from any other dispatch it is surfaced to the connection's
    /// error hook and stays local.
    async fn handle(&self, ns: Arc<NsConn>, msg: Message) -> Result<(), Error>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Arc<NsConn>, Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Error>> + Send,
{
    async fn handle(&self, ns: Arc<NsConn>, msg: Message) -> Result<(), Error> {
        (self)(ns, msg).await
    }
}

/// Event-name to handler table for one namespace.
#[derive(Clone, Default)]
pub struct Events {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl Events {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`, replacing any previous registration.
    ///
    /// Builder-style; chain calls when constructing a [`Namespaces`] template.
    #[must_use]
    pub fn on(mut self, event: &str, handler: impl EventHandler + 'static) -> Self {
        self.register(event, handler);
        self
    }

    /// Register `handler` for `event` in place.
    pub fn register(&mut self, event: &str, handler: impl EventHandler + 'static) {
        let _ = self.handlers.insert(event.to_owned(), Arc::new(handler));
    }

    /// Whether a specific handler exists for `event`.
    pub fn has(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the table has no handlers at all.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Resolve the handler that dispatch would invoke for `event`.
    ///
    /// The specific handler wins; otherwise the [`ON_ANY_EVENT`] catch-all,
    /// if registered, sees the event — including system events, which
    /// catch-all handlers filter themselves via
    /// [`crate::is_system_event`].
    pub fn resolve(&self, event: &str) -> Option<&Arc<dyn EventHandler>> {
        self.handlers
            .get(event)
            .or_else(|| self.handlers.get(ON_ANY_EVENT))
    }

    /// Dispatch `msg` on `ns` through this table. No-op when neither a
    /// specific handler nor a catch-all is registered.
    pub(crate) async fn fire(&self, ns: &Arc<NsConn>, msg: Message) -> Result<(), Error> {
        match self.resolve(&msg.event) {
            Some(handler) => handler.handle(Arc::clone(ns), msg).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Events").field("events", &names).finish()
    }
}

/// Namespace-name to event-table template.
#[derive(Clone, Default)]
pub struct Namespaces {
    inner: HashMap<String, Events>,
}

impl Namespaces {
    /// Create an empty template.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `events` under `name`, replacing any previous table.
    #[must_use]
    pub fn namespace(mut self, name: &str, events: Events) -> Self {
        let _ = self.inner.insert(name.to_owned(), events);
        self
    }

    /// Look up the event table for `name`.
    pub fn get(&self, name: &str) -> Option<&Events> {
        self.inner.get(name)
    }

    /// Whether `name` is a registered namespace.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// Registered namespace names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Namespaces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespaces")
            .field("namespaces", &self.names())
            .finish()
    }
}
