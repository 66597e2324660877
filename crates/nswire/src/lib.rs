//! Bidirectional, namespace-multiplexed messaging over any duplex frame
//! transport.
//!
//! One physical connection carries any number of independent namespaces,
//! each with its own event handlers and lifecycle. On top of fire-and-forget
//! events, [`NsConn::ask`] gives request/reply semantics with correlation
//! tokens, timeouts, and disconnect propagation. Servers and clients are
//! symmetric: both sides register the same kind of namespace template, and
//! either side can initiate a namespace connect.
//!
//! The core is transport-agnostic. Anything implementing [`Transport`]
//! plugs in; the `nswire-tungstenite` crate adapts WebSocket connections,
//! and [`transport::pipe`] provides an in-memory pair for tests.
//!
//! ```no_run
//! use std::sync::Arc;
//! use nswire::{ClientBuilder, Events, Message, Namespaces, NsConn};
//!
//! # async fn demo(transport: Box<dyn nswire::Transport>) -> Result<(), nswire::Error> {
//! let namespaces = Namespaces::new().namespace(
//!     "chat",
//!     Events::new().on("message", |ns: Arc<NsConn>, msg: Message| async move {
//!         println!("{}: {:?}", ns.namespace(), msg.body);
//!         Ok(())
//!     }),
//! );
//! let client = ClientBuilder::new(namespaces).dial(transport);
//! let chat = client.connect("chat").await?;
//! chat.emit("message", b"hello".to_vec()).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod events;
pub mod message;
mod metrics_names;
pub mod namespace;
pub mod server;
pub mod transport;

pub use client::{Client, ClientBuilder};
pub use config::ConnConfig;
pub use conn::{Conn, ConnId};
pub use error::{Error, is_disconnect_error};
pub use events::{EventHandler, Events, Namespaces};
pub use message::{
    Message, MessageKind, ON_ANY_EVENT, ON_NAMESPACE_CONNECT, ON_NAMESPACE_CONNECTED,
    ON_NAMESPACE_DISCONNECT, ON_NATIVE_MESSAGE, is_system_event,
};
pub use namespace::{NamespaceState, NsConn};
pub use server::Server;
pub use transport::{Transport, TransportReader, TransportWriter};
