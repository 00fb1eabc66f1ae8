//! Network library for streaming live scan meshes to a remote consumer
//!
//! A [`MeshStreamer`] keeps one WebSocket connection to a consumer alive, reconnecting
//! with capped exponential backoff and probing liveness while connected. Mesh events
//! are encoded into JSON envelopes (`{"type": ..., "data": ...}`) and written through a
//! single-writer queue so frames reach the wire in the order they were sent.
//! [`MeshReceiver`] is the matching server side. C and C++ apps can embed the client
//! through the `ffi` feature.

pub mod client;
pub mod codec;
pub mod prober;
pub mod protocol;
pub mod receiver;
pub mod reconnect;
pub mod sender;
pub mod transport;
pub mod types;

#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use client::{ConnectionState, MeshStreamer, NetworkError, StreamerConfig};
pub use codec::{CodecError, MeshPayload};
pub use protocol::{Envelope, MessageType, Protocol, ProtocolError, PROTOCOL_VERSION};
pub use receiver::{
    MeshReceiver, ReceiveError, ReceivedEnvelope, ReceiverConfig, ReceiverHandle, ReceiverStats,
};
pub use reconnect::ReconnectPolicy;
pub use sender::StreamerStats;
pub use transport::{Connector, Endpoint, TransportError, WebSocketConnector};
pub use types::{MeshBounds, MeshEvent, MeshEventKind, MeshSnapshot};

/// Result type for client operations
pub type Result<T> = std::result::Result<T, NetworkError>;
