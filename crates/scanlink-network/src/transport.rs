//! Transport seam between the connection manager and the socket
//!
//! The manager only sees [`Connector`], [`FrameSink`] and [`FrameStream`]. The
//! production implementation speaks WebSocket through tokio-tungstenite; tests
//! plug in scripted in-memory transports.

use crate::protocol::{PROTOCOL_HEADER, PROTOCOL_VERSION};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Uri};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};

/// Reasons an address is not a usable streaming endpoint
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("malformed URI: {0}")]
    Malformed(String),

    #[error("missing scheme, expected ws:// or wss://")]
    MissingScheme,

    #[error("unsupported scheme {0:?}, expected ws or wss")]
    UnsupportedScheme(String),

    #[error("missing host")]
    MissingHost,
}

/// Errors raised by a transport while opening, reading or writing
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed by remote")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Other(String),
}

/// Validated `ws://` or `wss://` endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: String,
    host: String,
    port: u16,
    secure: bool,
}

impl Endpoint {
    /// Parse a `scheme://host[:port][/path]` address.
    ///
    /// The port defaults to 80 for `ws` and 443 for `wss`.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let address = address.trim();
        let uri: Uri = address
            .parse()
            .map_err(|e: tokio_tungstenite::tungstenite::http::uri::InvalidUri| {
                AddressError::Malformed(e.to_string())
            })?;

        let secure = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("ws") => false,
            Some(s) if s.eq_ignore_ascii_case("wss") => true,
            Some(other) => return Err(AddressError::UnsupportedScheme(other.to_string())),
            None => return Err(AddressError::MissingScheme),
        };

        let host = match uri.host() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(AddressError::MissingHost),
        };
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        Ok(Self {
            url: address.to_string(),
            host,
            port,
            secure,
        })
    }

    /// Address as given to `parse`
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the host name
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the port, defaulted from the scheme when absent
    pub fn port(&self) -> u16 {
        self.port
    }

    /// True for `wss://`
    pub fn is_secure(&self) -> bool {
        self.secure
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Frame written by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Encoded envelope
    Text(String),
    /// Transport-level liveness probe (WebSocket ping)
    Probe(Vec<u8>),
    /// Close handshake; the writer stops after it
    Close,
}

impl OutboundFrame {
    /// Payload size in bytes
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Probe(payload) => payload.len(),
            Self::Close => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Frame read from the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    /// Probe from the peer
    Probe(Vec<u8>),
    /// Answer to one of our probes
    ProbeAck(Vec<u8>),
    /// Peer started the close handshake
    Close(Option<String>),
}

/// Write half of an open transport
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError>;
}

/// Read half of an open transport. `None` means the stream ended.
#[async_trait]
pub trait FrameStream: Send {
    async fn next_frame(&mut self) -> Option<Result<InboundFrame, TransportError>>;
}

/// Both halves of a freshly opened transport
pub struct TransportHandle {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle").finish_non_exhaustive()
    }
}

/// Opens transports to an endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> Result<TransportHandle, TransportError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector built on tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<TransportHandle, TransportError> {
        debug!("Opening WebSocket to {}", endpoint);

        let mut request = endpoint.url().into_client_request()?;
        request
            .headers_mut()
            .insert(PROTOCOL_HEADER, HeaderValue::from(PROTOCOL_VERSION));

        let (socket, response) = connect_async(request).await?;
        info!(
            "WebSocket handshake with {} complete (status {})",
            endpoint,
            response.status()
        );

        let (sink, stream) = socket.split();
        Ok(TransportHandle {
            sink: Box::new(WebSocketSink { inner: sink }),
            stream: Box::new(WebSocketFrames { inner: stream }),
        })
    }
}

struct WebSocketSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        match frame {
            OutboundFrame::Text(text) => self.inner.send(Message::Text(text)).await?,
            OutboundFrame::Probe(payload) => self.inner.send(Message::Ping(payload)).await?,
            OutboundFrame::Close => {
                trace!("Sending close frame");
                self.inner.close().await?
            }
        }
        Ok(())
    }
}

struct WebSocketFrames {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WebSocketFrames {
    async fn next_frame(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        let message = match self.inner.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(e.into())),
        };
        let frame = match message {
            Message::Text(text) => InboundFrame::Text(text),
            Message::Binary(data) => InboundFrame::Binary(data),
            Message::Ping(data) => InboundFrame::Probe(data),
            Message::Pong(data) => InboundFrame::ProbeAck(data),
            Message::Close(frame) => InboundFrame::Close(frame.map(|f| f.reason.to_string())),
            Message::Frame(frame) => InboundFrame::Binary(frame.into_data()),
        };
        Some(Ok(frame))
    }
}
