//! Reference WebSocket receiver for streamed mesh envelopes
//!
//! Accepts any number of clients, decodes every text frame with [`Protocol::decode`]
//! and forwards the result over a channel. Used by the receiver service binary and by
//! the integration tests, which also use [`ReceiverHandle::drop_connections`] to cut
//! live clients off and watch them reconnect.

use crate::protocol::{Envelope, Protocol, ProtocolError, DEFAULT_MAX_MESSAGE_SIZE};
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, trace, warn};

/// Errors that can occur while setting up or running the receiver
#[derive(Error, Debug)]
pub enum ReceiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Handshake error: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Configuration for the mesh receiver
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Largest text frame that will be decoded
    pub max_message_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Decoded envelope with connection metadata
#[derive(Debug, Clone)]
pub struct ReceivedEnvelope {
    pub envelope: Envelope,
    /// Sequential id of the connection it arrived on, starting at 1
    pub connection_id: u64,
    pub source_addr: SocketAddr,
    pub received_at: Instant,
}

/// Statistics about received data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    /// Envelopes decoded and forwarded
    pub frames_received: u64,
    /// Text bytes read, including frames that failed to decode
    pub bytes_received: u64,
    /// Pings from clients
    pub probes_received: u64,
    /// Completed WebSocket handshakes
    pub connections_accepted: u64,
    /// Text frames rejected by the decoder
    pub decode_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    probes_received: AtomicU64,
    connections_accepted: AtomicU64,
    decode_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ReceiverStats {
        ReceiverStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            probes_received: self.probes_received.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// WebSocket mesh receiver
pub struct MeshReceiver {
    listener: TcpListener,
    protocol: Protocol,
}

impl MeshReceiver {
    /// Create a new mesh receiver listening on the specified address
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, ReceiveError> {
        Self::bind_with_config(addr, ReceiverConfig::default()).await
    }

    /// Create a new mesh receiver with custom configuration
    pub async fn bind_with_config<A: ToSocketAddrs>(
        addr: A,
        config: ReceiverConfig,
    ) -> Result<Self, ReceiveError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ReceiveError::Bind(format!("Failed to bind: {e}")))?;
        info!("Mesh receiver listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            protocol: Protocol::new().with_max_message_size(config.max_message_size),
        })
    }

    /// Get the local address the receiver is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, ReceiveError> {
        Ok(self.listener.local_addr()?)
    }

    /// `ws://` URL clients can connect to
    pub fn url(&self) -> Result<String, ReceiveError> {
        Ok(format!("ws://{}", self.local_addr()?))
    }

    /// Start accepting connections in the background.
    ///
    /// Dropping the returned handle stops the receiver.
    pub fn run(
        self,
    ) -> Result<(ReceiverHandle, mpsc::UnboundedReceiver<ReceivedEnvelope>), ReceiveError> {
        let local_addr = self.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let (kick, _) = watch::channel(0u64);
        let (stop, _) = watch::channel(false);

        let task = tokio::spawn(accept_loop(
            self.listener,
            self.protocol,
            tx,
            Arc::clone(&counters),
            kick.subscribe(),
            stop.subscribe(),
        ));

        let handle = ReceiverHandle {
            local_addr,
            counters,
            kick,
            stop,
            task,
        };
        Ok((handle, rx))
    }
}

/// Control over a running [`MeshReceiver`]
pub struct ReceiverHandle {
    local_addr: SocketAddr,
    counters: Arc<Counters>,
    kick: watch::Sender<u64>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReceiverHandle {
    /// Get the address the receiver is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients can connect to
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Abruptly drop every live connection without a close handshake.
    ///
    /// The listener keeps accepting, so clients can reconnect.
    pub fn drop_connections(&self) {
        self.kick.send_modify(|generation| *generation += 1);
    }

    /// Get statistics about received data
    pub fn stats(&self) -> ReceiverStats {
        self.counters.snapshot()
    }

    /// Close every connection with a close frame and stop accepting
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!("Receiver task ended abnormally: {}", e);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    protocol: Protocol,
    tx: mpsc::UnboundedSender<ReceivedEnvelope>,
    counters: Arc<Counters>,
    kick: watch::Receiver<u64>,
    mut stop: watch::Receiver<bool>,
) {
    let mut next_id = 0u64;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    next_id += 1;
                    debug!("Accepted TCP connection {} from {}", next_id, addr);
                    // Only kicks issued after this connection arrived apply to it
                    let mut kick = kick.clone();
                    kick.borrow_and_update();
                    tokio::spawn(serve_connection(
                        stream,
                        Peer { id: next_id, addr },
                        protocol.clone(),
                        tx.clone(),
                        Arc::clone(&counters),
                        kick,
                        stop.clone(),
                    ));
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
            _ = stop.changed() => break,
        }
    }
    info!(
        "Mesh receiver stopped after {} connections",
        counters.connections_accepted.load(Ordering::Relaxed)
    );
}

#[derive(Debug, Clone, Copy)]
struct Peer {
    id: u64,
    addr: SocketAddr,
}

async fn serve_connection(
    stream: TcpStream,
    peer: Peer,
    protocol: Protocol,
    tx: mpsc::UnboundedSender<ReceivedEnvelope>,
    counters: Arc<Counters>,
    mut kick: watch::Receiver<u64>,
    mut stop: watch::Receiver<bool>,
) {
    let mut socket = match accept_async(stream).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", peer.addr, e);
            return;
        }
    };
    counters.connections_accepted.fetch_add(1, Ordering::Relaxed);
    info!("Client {} connected from {}", peer.id, peer.addr);

    loop {
        tokio::select! {
            message = socket.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if !forward(&text, peer, &protocol, &tx, &counters) {
                        break;
                    }
                }
                Some(Ok(Message::Ping(_))) => {
                    counters.probes_received.fetch_add(1, Ordering::Relaxed);
                    trace!("Probe from client {}", peer.id);
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Client {} sent close: {:?}", peer.id, frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Client {} read error: {}", peer.id, e);
                    break;
                }
                None => break,
            },
            _ = kick.changed() => {
                info!("Dropping client {}", peer.id);
                return;
            }
            _ = stop.changed() => {
                let _ = socket.close(None).await;
                break;
            }
        }
    }
    info!("Client {} disconnected", peer.id);
}

/// Decode one text frame; returns false once nobody is listening
fn forward(
    text: &str,
    peer: Peer,
    protocol: &Protocol,
    tx: &mpsc::UnboundedSender<ReceivedEnvelope>,
    counters: &Counters,
) -> bool {
    counters
        .bytes_received
        .fetch_add(text.len() as u64, Ordering::Relaxed);

    match protocol.decode(text) {
        Ok(envelope) => {
            counters.frames_received.fetch_add(1, Ordering::Relaxed);
            trace!(
                "Received {} from client {}",
                envelope.message_type(),
                peer.id
            );
            tx.send(ReceivedEnvelope {
                envelope,
                connection_id: peer.id,
                source_addr: peer.addr,
                received_at: Instant::now(),
            })
            .is_ok()
        }
        Err(e) => {
            counters.decode_errors.fetch_add(1, Ordering::Relaxed);
            warn!("Rejected frame from client {}: {}", peer.id, e);
            true
        }
    }
}
