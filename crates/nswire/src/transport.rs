//! Transport capability consumed by connections.
//!
//! Any duplex byte-stream that can carry self-contained frames plugs in
//! here; the core never sees sockets, TLS, or upgrade negotiation. A
//! transport splits into independent writer and reader halves so each
//! connection can run one dedicated task per direction.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Error;

/// Receiving half of a transport.
#[async_trait]
pub trait TransportReader: Send {
    /// Wait for the next complete frame.
    ///
    /// Returns [`Error::Closed`] once the peer has gone away.
    async fn receive(&mut self) -> Result<Bytes, Error>;
}

/// Sending half of a transport.
#[async_trait]
pub trait TransportWriter: Send {
    /// Write one complete frame.
    async fn send(&mut self, frame: Bytes) -> Result<(), Error>;

    /// Close the transport for writing.
    async fn close(&mut self) -> Result<(), Error>;
}

/// A pluggable duplex frame transport.
pub trait Transport: Send + 'static {
    /// Split into independent writer and reader halves.
    fn split(self: Box<Self>) -> (Box<dyn TransportWriter>, Box<dyn TransportReader>);
}

/// Create a connected in-memory transport pair.
///
/// Frames written to one end arrive at the other, through bounded channels
/// of the given capacity. A full channel exerts real backpressure, which is
/// what the slow-peer tests rely on.
pub fn pipe(capacity: usize) -> (Pipe, Pipe) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        Pipe {
            tx: a_tx,
            rx: b_rx,
        },
        Pipe {
            tx: b_tx,
            rx: a_rx,
        },
    )
}

/// One end of an in-memory transport pair from [`pipe`].
pub struct Pipe {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

impl Transport for Pipe {
    fn split(self: Box<Self>) -> (Box<dyn TransportWriter>, Box<dyn TransportReader>) {
        (
            Box::new(PipeWriter { tx: Some(self.tx) }),
            Box::new(PipeReader { rx: self.rx }),
        )
    }
}

struct PipeWriter {
    tx: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl TransportWriter for PipeWriter {
    async fn send(&mut self, frame: Bytes) -> Result<(), Error> {
        let tx = self.tx.as_ref().ok_or(Error::Closed)?;
        tx.send(frame).await.map_err(|_| Error::Closed)
    }

    async fn close(&mut self) -> Result<(), Error> {
        // Dropping the sender ends the peer's receive stream.
        self.tx = None;
        Ok(())
    }
}

struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl TransportReader for PipeReader {
    async fn receive(&mut self) -> Result<Bytes, Error> {
        self.rx.recv().await.ok_or(Error::Closed)
    }
}
