use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Vertex channels that `update` and `apply` operate on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct VertexChannels: u16 {
        const POSITION = 1 << 0;
        const NORMAL = 1 << 1;
        const TANGENT = 1 << 2;
        /// Primary UVs (remapped through the atlas).
        const UV0 = 1 << 3;
        /// Lightmap UVs.
        const UV1 = 1 << 4;
        const COLOR = 1 << 5;
        const SKIN_WEIGHTS = 1 << 6;
        const BLEND_SHAPES = 1 << 7;
    }
}

impl Default for VertexChannels {
    fn default() -> Self {
        VertexChannels::all()
    }
}

impl VertexChannels {
    /// Channels whose data lives in per-vertex arrays of the working buffer.
    pub const PER_VERTEX: VertexChannels = VertexChannels::POSITION
        .union(VertexChannels::NORMAL)
        .union(VertexChannels::TANGENT)
        .union(VertexChannels::UV0)
        .union(VertexChannels::UV1)
        .union(VertexChannels::COLOR)
        .union(VertexChannels::SKIN_WEIGHTS);
}
