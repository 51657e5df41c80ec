//! Mesh combining: merge a cluster's surfaces into destination meshes.

pub mod channels;
pub mod combiner;
pub mod skinned;

pub use channels::VertexChannels;
pub use combiner::{CombineReport, DestinationMesh, MeshCombiner};
pub use skinned::SkinnedBounds;
