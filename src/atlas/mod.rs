//! Texture atlas baking: tiling analysis, bin packing, rasterization.

pub mod bake;
pub mod packer;
pub mod texture;
pub mod uv_rect;

pub use bake::{ClusterAtlas, TextureBakeJob, bake_cluster};
pub use packer::{Layout, PackLimits, PackedPage, Placement};
pub use uv_rect::{TilingInfo, TilingTreatment};
