//! Geometry codec: flattens a mesh snapshot into its wire payload
//!
//! The wire format is numeric-only JSON, which has no representation for NaN or
//! infinities. Every float is sanitized on the way out: non-finite values become `0`.
//! Encoding never reorders vertices or faces, and sanitizing an already sanitized
//! payload is a no-op.

use crate::types::MeshSnapshot;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while converting between snapshots and payloads
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Face {face} references vertex {index} but the mesh has {vertex_count} vertices")]
    FaceIndexOutOfRange {
        face: usize,
        index: u32,
        vertex_count: usize,
    },

    #[error("Vertex buffer length {0} is not divisible by 3")]
    VertexBufferLength(usize),
}

/// Transmission-safe form of a mesh snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshPayload {
    pub id: String,
    /// Flattened vertex positions (x,y,z triplets)
    pub vertices: Vec<f32>,
    pub faces: Vec<[u32; 3]>,
    /// Row-major 4x4 transform
    pub transform: [f32; 16],
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

impl MeshPayload {
    /// Get the number of vertices in the payload
    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / 3
    }

    /// Get the number of triangles in the payload
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// True if every float in the payload is finite
    pub fn is_finite(&self) -> bool {
        self.vertices.iter().all(|v| v.is_finite())
            && self.transform.iter().all(|v| v.is_finite())
            && self.timestamp.is_finite()
    }
}

/// Replace a non-finite value with zero
#[inline]
pub fn sanitize(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Replace a non-finite timestamp with zero
#[inline]
pub fn sanitize_f64(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Encode a snapshot into its wire payload.
///
/// Rejects snapshots whose faces reference missing vertices; nothing is truncated.
pub fn encode(snapshot: &MeshSnapshot) -> Result<MeshPayload, CodecError> {
    snapshot.validate()?;

    let vertices = snapshot
        .vertices
        .iter()
        .flat_map(|v| v.iter().copied().map(sanitize))
        .collect();

    Ok(MeshPayload {
        id: snapshot.id.clone(),
        vertices,
        faces: snapshot.faces.clone(),
        transform: snapshot.transform.map(sanitize),
        timestamp: sanitize_f64(snapshot.timestamp),
    })
}

/// Rebuild a snapshot from a wire payload, checking the same invariants `encode` enforces
pub fn decode(payload: MeshPayload) -> Result<MeshSnapshot, CodecError> {
    if payload.vertices.len() % 3 != 0 {
        return Err(CodecError::VertexBufferLength(payload.vertices.len()));
    }

    let vertices = payload
        .vertices
        .chunks_exact(3)
        .map(|c| [c[0], c[1], c[2]])
        .collect();

    let snapshot = MeshSnapshot {
        id: payload.id,
        vertices,
        faces: payload.faces,
        transform: payload.transform,
        timestamp: payload.timestamp,
    };
    snapshot.validate()?;
    Ok(snapshot)
}
