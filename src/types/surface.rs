use glam::Mat4;
use serde::{Deserialize, Serialize};

use super::bounds::BoundingBox;
use super::material::{MaterialId, MaterialLibrary};
use super::mesh::MeshData;

/// Stable identity of a scene surface.
///
/// Remains valid as a key in the combiner even after the surface itself has
/// been removed from the scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceId(pub u64);

impl std::fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

/// Index of a bone in [`Scene::bones`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoneId(pub usize);

/// A skeleton joint with its current world transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bone {
    pub name: String,
    pub transform: Mat4,
}

fn enabled() -> bool {
    true
}

/// A drawable element: one mesh drawn with one or more materials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Surface {
    pub id: SurfaceId,
    #[serde(default)]
    pub name: String,
    /// Index into [`Scene::meshes`]; `None` for a surface with no mesh.
    pub mesh: Option<usize>,
    /// One material per submesh slot.
    #[serde(default)]
    pub materials: Vec<MaterialId>,
    /// Local-to-world transform.
    #[serde(default = "identity")]
    pub transform: Mat4,
    #[serde(default)]
    pub world_bounds: BoundingBox,
    #[serde(default)]
    pub lightmap_index: Option<i32>,
    /// Level inside the owning LOD group, when there is one.
    #[serde(default)]
    pub lod_level: Option<u32>,
    /// Skin bones referenced by `MeshData::bone_weights`.
    #[serde(default)]
    pub bones: Vec<BoneId>,
    #[serde(default)]
    pub root_bone: Option<BoneId>,
    /// Cleared by the combiner after a successful merge when requested.
    #[serde(default = "enabled")]
    pub rendering_enabled: bool,
}

fn identity() -> Mat4 {
    Mat4::IDENTITY
}

impl Surface {
    pub fn new(id: u64, mesh: usize, materials: Vec<MaterialId>) -> Self {
        Self {
            id: SurfaceId(id),
            name: format!("surface_{id}"),
            mesh: Some(mesh),
            materials,
            transform: Mat4::IDENTITY,
            world_bounds: BoundingBox::default(),
            lightmap_index: None,
            lod_level: None,
            bones: Vec::new(),
            root_bone: None,
            rendering_enabled: true,
        }
    }

    /// Human-readable label for error messages.
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            self.id.to_string()
        } else {
            self.name.clone()
        }
    }
}

/// The externally owned scene the baker reads from.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub surfaces: Vec<Surface>,
    pub meshes: Vec<MeshData>,
    pub library: MaterialLibrary,
    pub bones: Vec<Bone>,
}

impl Scene {
    pub fn surface(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.iter().find(|s| s.id == id)
    }

    pub fn surface_mut(&mut self, id: SurfaceId) -> Option<&mut Surface> {
        self.surfaces.iter_mut().find(|s| s.id == id)
    }

    pub fn mesh_of(&self, surface: &Surface) -> Option<&MeshData> {
        surface.mesh.and_then(|i| self.meshes.get(i))
    }

    pub fn surface_ids(&self) -> Vec<SurfaceId> {
        self.surfaces.iter().map(|s| s.id).collect()
    }
}
