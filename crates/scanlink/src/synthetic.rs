//! Synthetic scan source for driving a consumer without a scanner attached
//!
//! Each patch is a rotating cube that gains triangles with every revision, the way a
//! reconstructed surface fills in as the scanner sees more of it. Patches are visited
//! round-robin: the first visit reports the patch as created, later visits as updated.

use scanlink_network::types::{unix_timestamp, IDENTITY_TRANSFORM};
use scanlink_network::{MeshEvent, MeshSnapshot};
use uuid::Uuid;

const CUBE_VERTS: [[f32; 3]; 8] = [
    [-1.0, -1.0, -1.0],
    [1.0, -1.0, -1.0],
    [1.0, 1.0, -1.0],
    [-1.0, 1.0, -1.0],
    [-1.0, -1.0, 1.0],
    [1.0, -1.0, 1.0],
    [1.0, 1.0, 1.0],
    [-1.0, 1.0, 1.0],
];

// Two triangles per side
const CUBE_FACES: [[u32; 3]; 12] = [
    // Front
    [0, 1, 2],
    [0, 2, 3],
    // Back
    [5, 4, 7],
    [5, 7, 6],
    // Left
    [4, 0, 3],
    [4, 3, 7],
    // Right
    [1, 5, 6],
    [1, 6, 2],
    // Top
    [3, 2, 6],
    [3, 6, 7],
    // Bottom
    [4, 5, 1],
    [4, 1, 0],
];

const SCALE: f32 = 10.0;
const PATCH_SPACING: f32 = 30.0;

#[derive(Debug, Clone)]
struct Patch {
    id: String,
    offset: [f32; 3],
    revision: u32,
}

/// Endless round-robin source of mesh events
#[derive(Debug, Clone)]
pub struct SyntheticScan {
    patches: Vec<Patch>,
    triangles: usize,
    next: usize,
}

impl SyntheticScan {
    /// `patches` surface patches, each growing to at most `triangles` triangles
    pub fn new(patches: usize, triangles: usize) -> Self {
        let patches = (0..patches.max(1))
            .map(|i| Patch {
                id: Uuid::new_v4().to_string(),
                offset: [i as f32 * PATCH_SPACING, 0.0, 0.0],
                revision: 0,
            })
            .collect();
        Self {
            patches,
            triangles,
            next: 0,
        }
    }

    /// Identifiers of the patches, in visiting order
    pub fn patch_ids(&self) -> impl Iterator<Item = &str> {
        self.patches.iter().map(|p| p.id.as_str())
    }
}

impl Iterator for SyntheticScan {
    type Item = MeshEvent;

    fn next(&mut self) -> Option<MeshEvent> {
        let index = self.next % self.patches.len();
        self.next = self.next.wrapping_add(1);

        let patch = &mut self.patches[index];
        let snapshot = patch_snapshot(patch, self.triangles);
        let first = patch.revision == 0;
        patch.revision += 1;

        Some(if first {
            MeshEvent::created(snapshot)
        } else {
            MeshEvent::updated(snapshot)
        })
    }
}

/// Triangles a patch has at a given revision
fn face_count_at(revision: u32, max_triangles: usize) -> usize {
    (2 * (revision as usize + 1)).min(max_triangles)
}

fn patch_snapshot(patch: &Patch, max_triangles: usize) -> MeshSnapshot {
    let face_count = face_count_at(patch.revision, max_triangles);
    let shells = face_count.div_ceil(CUBE_FACES.len());

    let angle = patch.revision as f32 * 0.1;
    let (sin_a, cos_a) = angle.sin_cos();

    // Faces beyond the first twelve land on larger concentric cubes
    let mut vertices = Vec::with_capacity(shells * CUBE_VERTS.len());
    for shell in 0..shells {
        let scale = SCALE * (1.0 + shell as f32 * 0.5);
        for v in &CUBE_VERTS {
            // Rotate around Y
            let x = v[0] * cos_a - v[2] * sin_a;
            let z = v[0] * sin_a + v[2] * cos_a;
            vertices.push([x * scale, v[1] * scale, z * scale]);
        }
    }

    let faces = (0..face_count)
        .map(|i| {
            let base = (i / CUBE_FACES.len() * CUBE_VERTS.len()) as u32;
            CUBE_FACES[i % CUBE_FACES.len()].map(|index| base + index)
        })
        .collect();

    let mut transform = IDENTITY_TRANSFORM;
    transform[3] = patch.offset[0];
    transform[7] = patch.offset[1];
    transform[11] = patch.offset[2];

    MeshSnapshot::new(patch.id.clone())
        .with_geometry(vertices, faces)
        .with_transform(transform)
        .with_timestamp(unix_timestamp())
}
