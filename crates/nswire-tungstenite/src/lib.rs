//! WebSocket transport for `nswire`, built on `tokio-tungstenite`.
//!
//! Every message envelope travels as one binary WebSocket frame; inbound
//! text frames are accepted too, so browser peers can speak the protocol
//! without binary support. [`dial`] and [`accept`] wrap single streams,
//! [`serve`] runs an accept loop that feeds a [`Server`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use nswire::{Error, Server, Transport, TransportReader, TransportWriter};

/// A WebSocket stream usable as an `nswire` transport.
pub struct WsTransport<S> {
    inner: WebSocketStream<S>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an already-upgraded WebSocket stream.
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner }
    }
}

impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn split(self: Box<Self>) -> (Box<dyn TransportWriter>, Box<dyn TransportReader>) {
        let (sink, stream) = self.inner.split();
        (Box::new(WsWriter { sink }), Box::new(WsReader { stream }))
    }
}

struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
}

#[async_trait]
impl<S> TransportWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Bytes) -> Result<(), Error> {
        self.sink
            .send(WsMessage::Binary(frame))
            .await
            .map_err(map_ws_err)
    }

    async fn close(&mut self) -> Result<(), Error> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(map_ws_err(err)),
        }
    }
}

struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> TransportReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn receive(&mut self) -> Result<Bytes, Error> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(err)) => return Err(map_ws_err(err)),
                None => return Err(Error::Closed),
            };
            match msg {
                WsMessage::Binary(frame) => return Ok(frame),
                WsMessage::Text(text) => return Ok(Bytes::from(text)),
                WsMessage::Close(_) => return Err(Error::Closed),
                // Control frames are handled by the protocol layer.
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
            }
        }
    }
}

fn map_ws_err(err: WsError) -> Error {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => Error::Closed,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => Error::Closed,
        other => Error::Transport {
            message: other.to_string(),
        },
    }
}

/// Dial `url` and perform the WebSocket upgrade.
pub async fn dial(url: &str) -> Result<WsTransport<MaybeTlsStream<TcpStream>>, Error> {
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(map_ws_err)?;
    debug!(url, "websocket dialed");
    Ok(WsTransport::new(stream))
}

/// Perform the server side of the WebSocket upgrade on `stream`.
pub async fn accept<S>(stream: S) -> Result<WsTransport<S>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(map_ws_err)?;
    Ok(WsTransport::new(ws))
}

/// Accept TCP connections from `listener` forever, upgrading each to a
/// WebSocket and handing it to `server`.
///
/// Upgrade and accept failures are logged and do not stop the loop.
pub async fn serve(listener: TcpListener, server: Arc<Server>) -> Result<(), Error> {
    loop {
        let (stream, addr) = listener.accept().await.map_err(|err| Error::Transport {
            message: err.to_string(),
        })?;
        let server = Arc::clone(&server);
        let _ = tokio::spawn(async move {
            match accept(stream).await {
                Ok(transport) => {
                    if let Err(err) = server.accept(Box::new(transport)).await {
                        warn!(%addr, error = %err, "connection rejected");
                    }
                }
                Err(err) => warn!(%addr, error = %err, "websocket upgrade failed"),
            }
        });
    }
}
