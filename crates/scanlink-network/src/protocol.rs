//! Wire protocol for streaming scan meshes
//!
//! Every message is a UTF-8 JSON text frame shaped `{"type": ..., "data": ...}`.
//! The `type` tag decides the payload shape; a payload that does not match its
//! declared type is rejected on decode. Liveness probes use WebSocket pings and
//! never appear as envelopes.

use crate::codec::{self, CodecError, MeshPayload};
use crate::types::{unix_timestamp, MeshEventKind, MeshSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, trace};

/// Protocol version, announced in the `x-scanlink-protocol` handshake header
pub const PROTOCOL_VERSION: u16 = 1;

/// Handshake header carrying [`PROTOCOL_VERSION`]
pub const PROTOCOL_HEADER: &str = "x-scanlink-protocol";

/// Maximum message size (100MB by default)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Envelope types in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// First report of a mesh patch
    MeshCreate,
    /// Revised geometry for a known patch
    MeshUpdate,
    /// Free-form diagnostic message for manual connectivity checks
    Test,
}

impl MessageType {
    /// Wire tag for this type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MeshCreate => "mesh_create",
            Self::MeshUpdate => "mesh_update",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mesh_create" => Ok(Self::MeshCreate),
            "mesh_update" => Ok(Self::MeshUpdate),
            "test" => Ok(Self::Test),
            other => Err(ProtocolError::UnknownMessageType(other.to_string())),
        }
    }
}

/// Protocol error types
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid geometry: {0}")]
    Geometry(#[from] CodecError),

    #[error("Unknown message type: {0:?}")]
    UnknownMessageType(String),

    #[error("Payload does not match message type {message_type}: {source}")]
    PayloadMismatch {
        message_type: MessageType,
        #[source]
        source: serde_json::Error,
    },

    #[error("Message too large: {size} bytes exceeds maximum {max_size} bytes")]
    MessageTooLarge { size: usize, max_size: usize },
}

/// Payload of a `test` envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestPayload {
    pub message: String,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

/// Typed message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Envelope {
    MeshCreate(MeshPayload),
    MeshUpdate(MeshPayload),
    Test(TestPayload),
}

impl Envelope {
    /// Wrap a mesh payload for the given event kind
    pub fn mesh(kind: MeshEventKind, payload: MeshPayload) -> Self {
        match kind {
            MeshEventKind::Created => Self::MeshCreate(payload),
            MeshEventKind::Updated => Self::MeshUpdate(payload),
        }
    }

    /// Build a `test` envelope stamped with the current time
    pub fn test(message: impl Into<String>) -> Self {
        Self::Test(TestPayload {
            message: message.into(),
            timestamp: unix_timestamp(),
        })
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::MeshCreate(_) => MessageType::MeshCreate,
            Self::MeshUpdate(_) => MessageType::MeshUpdate,
            Self::Test(_) => MessageType::Test,
        }
    }

    /// Mesh payload, if this is a mesh envelope
    pub fn mesh_payload(&self) -> Option<&MeshPayload> {
        match self {
            Self::MeshCreate(payload) | Self::MeshUpdate(payload) => Some(payload),
            Self::Test(_) => None,
        }
    }
}

/// Untyped view used to check the tag before committing to a payload shape
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEnvelope {
    #[serde(rename = "type")]
    message_type: String,
    data: serde_json::Value,
}

/// Envelope encoder/decoder
#[derive(Debug, Clone)]
pub struct Protocol {
    max_message_size: usize,
}

impl Default for Protocol {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl Protocol {
    /// Create a new protocol handler
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum message size
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Serialize an envelope into a text frame
    pub fn encode(&self, envelope: &Envelope) -> Result<String, ProtocolError> {
        let text = serde_json::to_string(envelope)?;
        self.check_size(text.len())?;
        trace!(
            "Encoded {} envelope ({} bytes)",
            envelope.message_type(),
            text.len()
        );
        Ok(text)
    }

    /// Run a snapshot through the geometry codec and wrap it as `mesh_create`/`mesh_update`
    pub fn encode_mesh(
        &self,
        kind: MeshEventKind,
        snapshot: &MeshSnapshot,
    ) -> Result<String, ProtocolError> {
        debug!(
            "Encoding mesh: id={}, vertices={}, faces={}",
            snapshot.id,
            snapshot.vertex_count(),
            snapshot.face_count()
        );
        let payload = codec::encode(snapshot)?;
        self.encode(&Envelope::mesh(kind, payload))
    }

    /// Encode a `test` envelope
    pub fn encode_test(&self, message: &str) -> Result<String, ProtocolError> {
        self.encode(&Envelope::test(message))
    }

    /// Parse a text frame, checking the payload shape against its declared type
    pub fn decode(&self, text: &str) -> Result<Envelope, ProtocolError> {
        self.check_size(text.len())?;

        let raw: RawEnvelope = serde_json::from_str(text)?;
        let message_type: MessageType = raw.message_type.parse()?;
        let mismatch = |source| ProtocolError::PayloadMismatch {
            message_type,
            source,
        };

        let envelope = match message_type {
            MessageType::MeshCreate | MessageType::MeshUpdate => {
                let payload: MeshPayload = serde_json::from_value(raw.data).map_err(mismatch)?;
                // Geometry invariants hold on the receiving side too
                let payload = codec::encode(&codec::decode(payload)?)?;
                match message_type {
                    MessageType::MeshCreate => Envelope::MeshCreate(payload),
                    _ => Envelope::MeshUpdate(payload),
                }
            }
            MessageType::Test => {
                Envelope::Test(serde_json::from_value(raw.data).map_err(mismatch)?)
            }
        };

        trace!("Decoded {} envelope", envelope.message_type());
        Ok(envelope)
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max_size: self.max_message_size,
            });
        }
        Ok(())
    }
}
