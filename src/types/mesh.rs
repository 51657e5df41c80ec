use serde::{Deserialize, Serialize};

/// Up to four bone influences for one vertex.
///
/// `bones` index into the owning surface's bone list (or, in a combined
/// mesh, into the destination's merged bone list).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoneWeight {
    pub bones: [u32; 4],
    pub weights: [f32; 4],
}

/// Per-vertex position/normal deltas for one blend-shape frame.
///
/// `vertex_start` is 0 for source meshes; combined meshes place each source
/// shape at the source's vertex offset so deltas stay sparse.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BlendShape {
    pub name: String,
    #[serde(default)]
    pub vertex_start: usize,
    /// Interleaved `[dx, dy, dz, ...]`, one triple per affected vertex.
    pub delta_positions: Vec<f32>,
    /// Same layout as `delta_positions`, or empty.
    #[serde(default)]
    pub delta_normals: Vec<f32>,
}

impl BlendShape {
    pub fn vertex_count(&self) -> usize {
        self.delta_positions.len() / 3
    }
}

/// The fundamental geometry container.
///
/// All buffers are contiguous `Vec<f32>` / `Vec<u32>`. Each entry in
/// `submeshes` is a triangle list drawn with the material in the same slot
/// of the owning surface's material list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MeshData {
    /// Interleaved positions: [x, y, z, x, y, z, ...]
    pub positions: Vec<f32>,
    /// Interleaved normals: [nx, ny, nz, ...] or empty
    #[serde(default)]
    pub normals: Vec<f32>,
    /// Interleaved tangents: [tx, ty, tz, tw, ...] or empty
    #[serde(default)]
    pub tangents: Vec<f32>,
    /// Primary UVs: [u, v, u, v, ...] or empty
    #[serde(default)]
    pub uvs: Vec<f32>,
    /// Secondary (lightmap) UVs, same layout as `uvs`, or empty
    #[serde(default)]
    pub uvs2: Vec<f32>,
    /// Interleaved vertex colors: [r, g, b, a, ...] or empty
    #[serde(default)]
    pub colors: Vec<f32>,
    /// Texture-array slice sampled by each vertex; empty outside texture-array output
    #[serde(default)]
    pub texture_slices: Vec<f32>,
    /// One entry per vertex, or empty for rigid meshes
    #[serde(default)]
    pub bone_weights: Vec<BoneWeight>,
    #[serde(default)]
    pub blend_shapes: Vec<BlendShape>,
    /// Triangle index lists, one per material slot
    pub submeshes: Vec<Vec<u32>>,
}

impl MeshData {
    /// Number of vertices (positions / 3).
    pub fn vertex_count(&self) -> usize {
        self.positions.len() / 3
    }

    /// Number of triangles across all submeshes.
    pub fn triangle_count(&self) -> usize {
        self.submeshes.iter().map(|s| s.len() / 3).sum()
    }

    pub fn index_count(&self) -> usize {
        self.submeshes.iter().map(Vec::len).sum()
    }

    pub fn submesh_count(&self) -> usize {
        self.submeshes.len()
    }

    /// Whether normals are present.
    pub fn has_normals(&self) -> bool {
        !self.normals.is_empty()
    }

    pub fn has_tangents(&self) -> bool {
        !self.tangents.is_empty()
    }

    /// Whether UV coordinates are present.
    pub fn has_uvs(&self) -> bool {
        !self.uvs.is_empty()
    }

    /// Whether vertex colors are present.
    pub fn has_colors(&self) -> bool {
        !self.colors.is_empty()
    }

    pub fn is_skinned(&self) -> bool {
        !self.bone_weights.is_empty()
    }

    /// Whether the mesh contains no geometry.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Layout signature used to detect topology changes between `add` and `update`.
    pub fn topology(&self) -> Topology {
        Topology {
            vertex_count: self.vertex_count(),
            submesh_triangles: self.submeshes.iter().map(|s| s.len() / 3).collect(),
        }
    }
}

/// Vertex count and per-submesh triangle counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub vertex_count: usize,
    pub submesh_triangles: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mesh() {
        let mesh = MeshData::default();
        assert!(mesh.is_empty());
        assert_eq!(mesh.vertex_count(), 0);
        assert_eq!(mesh.triangle_count(), 0);
        assert!(!mesh.has_normals());
        assert!(!mesh.has_uvs());
        assert!(!mesh.is_skinned());
    }

    #[test]
    fn quad_two_submeshes() {
        let mesh = MeshData {
            positions: vec![
                0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0,
            ],
            uvs: vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0],
            submeshes: vec![vec![0, 1, 2], vec![0, 2, 3]],
            ..Default::default()
        };

        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.triangle_count(), 2);
        assert_eq!(mesh.index_count(), 6);
        assert_eq!(mesh.submesh_count(), 2);
        assert!(mesh.has_uvs());
        assert_eq!(
            mesh.topology(),
            Topology {
                vertex_count: 4,
                submesh_triangles: vec![1, 1]
            }
        );
    }
}
