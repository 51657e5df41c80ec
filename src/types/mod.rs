pub mod bounds;
pub mod material;
pub mod mesh;
pub mod rect;
pub mod surface;

pub use bounds::BoundingBox;
pub use material::{Material, MaterialId, MaterialLibrary, TextureData, TextureSlot};
pub use mesh::{BlendShape, BoneWeight, MeshData, Topology};
pub use rect::{RECT_EPSILON, Rect};
pub use surface::{Bone, BoneId, Scene, Surface, SurfaceId};
