//! Mesh data handed to the client by the scene-reconstruction source

use crate::codec::CodecError;
use crate::protocol::MessageType;
use std::time::{SystemTime, UNIX_EPOCH};

/// Row-major 4x4 identity transform
pub const IDENTITY_TRANSFORM: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0, //
];

/// One surface patch's geometry at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct MeshSnapshot {
    /// Stable opaque identifier of the patch (e.g. an anchor UUID)
    pub id: String,
    /// Vertex positions in patch-local space
    pub vertices: Vec<[f32; 3]>,
    /// Triangles as indices into `vertices`
    pub faces: Vec<[u32; 3]>,
    /// Row-major 4x4 patch-to-world transform
    pub transform: [f32; 16],
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

impl MeshSnapshot {
    /// Create an empty snapshot with an identity transform, stamped with the current time
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vertices: Vec::new(),
            faces: Vec::new(),
            transform: IDENTITY_TRANSFORM,
            timestamp: unix_timestamp(),
        }
    }

    /// Replace the geometry
    pub fn with_geometry(mut self, vertices: Vec<[f32; 3]>, faces: Vec<[u32; 3]>) -> Self {
        self.vertices = vertices;
        self.faces = faces;
        self
    }

    /// Replace the transform
    pub fn with_transform(mut self, transform: [f32; 16]) -> Self {
        self.transform = transform;
        self
    }

    /// Replace the timestamp
    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Get the number of vertices in the patch
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Get the number of triangles in the patch
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Check that every face references an existing vertex
    pub fn validate(&self) -> Result<(), CodecError> {
        let vertex_count = self.vertices.len();
        for (face, indices) in self.faces.iter().enumerate() {
            if let Some(&index) = indices.iter().find(|&&i| i as usize >= vertex_count) {
                return Err(CodecError::FaceIndexOutOfRange {
                    face,
                    index,
                    vertex_count,
                });
            }
        }
        Ok(())
    }

    /// Axis-aligned bounds of the finite vertices, `None` if there are none
    pub fn bounds(&self) -> Option<MeshBounds> {
        let mut finite = self
            .vertices
            .iter()
            .filter(|v| v.iter().all(|c| c.is_finite()));
        let first = *finite.next()?;
        Some(finite.fold(MeshBounds::new(first, first), |mut bounds, v| {
            for axis in 0..3 {
                bounds.min[axis] = bounds.min[axis].min(v[axis]);
                bounds.max[axis] = bounds.max[axis].max(v[axis]);
            }
            bounds
        }))
    }
}

/// Spatial bounds of a patch in its local space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshBounds {
    /// Minimum coordinates (x, y, z)
    pub min: [f32; 3],
    /// Maximum coordinates (x, y, z)
    pub max: [f32; 3],
}

impl MeshBounds {
    /// Create new bounds
    pub fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self { min, max }
    }

    /// Calculate the center of the bounds
    pub fn center(&self) -> [f32; 3] {
        [
            (self.min[0] + self.max[0]) / 2.0,
            (self.min[1] + self.max[1]) / 2.0,
            (self.min[2] + self.max[2]) / 2.0,
        ]
    }

    /// Calculate the extent along each axis
    pub fn size(&self) -> [f32; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }
}

/// Whether a patch is new or a revision of one already reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshEventKind {
    /// First report of a patch
    Created,
    /// Revised geometry or transform for a known patch
    Updated,
}

impl MeshEventKind {
    /// Envelope type this event travels as
    pub fn message_type(self) -> MessageType {
        match self {
            Self::Created => MessageType::MeshCreate,
            Self::Updated => MessageType::MeshUpdate,
        }
    }
}

/// Event produced by the mesh source
#[derive(Debug, Clone, PartialEq)]
pub struct MeshEvent {
    pub kind: MeshEventKind,
    pub snapshot: MeshSnapshot,
}

impl MeshEvent {
    pub fn created(snapshot: MeshSnapshot) -> Self {
        Self {
            kind: MeshEventKind::Created,
            snapshot,
        }
    }

    pub fn updated(snapshot: MeshSnapshot) -> Self {
        Self {
            kind: MeshEventKind::Updated,
            snapshot,
        }
    }
}

/// Current wall-clock time in seconds since the Unix epoch
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
