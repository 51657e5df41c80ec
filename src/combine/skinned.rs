//! Bounds maintenance for combined skinned meshes.
//!
//! A skinned destination deforms every frame, so its bounds cannot come from
//! the vertex buffer. Both policies capture a small summary when the mesh is
//! applied and refresh from the current bone transforms afterwards, in time
//! proportional to bones or source surfaces rather than vertices.

use std::ops::Range;

use glam::{Mat4, Vec3};

use crate::config::SkinnedBoundsPolicy;
use crate::types::{Bone, BoneId, BoundingBox, MeshData};

/// Bind-pose summary of one source surface.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBounds {
    pub root: BoneId,
    pub bind_bounds: BoundingBox,
    /// Inverse of the root bone's transform at capture time.
    pub inverse_bind: Mat4,
}

/// Captured state from which skinned bounds are refreshed.
#[derive(Debug, Clone, PartialEq)]
pub enum SkinnedBounds {
    /// Each bone with the furthest distance of any vertex it influences.
    BoneAggregate { bones: Vec<(BoneId, f32)> },
    /// Per source surface bounds that follow the surface's root bone.
    SourceSurfaces { sources: Vec<SourceBounds> },
}

fn bone_position(bones: &[Bone], id: BoneId) -> Option<Vec3> {
    bones.get(id.0).map(|b| b.transform.w_axis.truncate())
}

impl SkinnedBounds {
    /// Summarize `mesh` for later refreshes.
    ///
    /// `slots` maps the mesh's bone-weight indices to scene bones; `sources`
    /// gives each source surface's root bone and vertex range.
    pub fn capture(
        policy: SkinnedBoundsPolicy,
        mesh: &MeshData,
        slots: &[BoneId],
        sources: &[(Option<BoneId>, Range<usize>)],
        bones: &[Bone],
    ) -> Self {
        let positions: &[[f32; 3]] = bytemuck::cast_slice(&mesh.positions[..mesh.positions.len() / 3 * 3]);
        match policy {
            SkinnedBoundsPolicy::BoneAggregate => {
                let mut radii = vec![0.0f32; slots.len()];
                for (p, bw) in positions.iter().zip(&mesh.bone_weights) {
                    let p = Vec3::from_array(*p);
                    for (&slot, &weight) in bw.bones.iter().zip(&bw.weights) {
                        let slot = slot as usize;
                        if weight <= 0.0 || slot >= slots.len() {
                            continue;
                        }
                        if let Some(origin) = bone_position(bones, slots[slot]) {
                            radii[slot] = radii[slot].max(p.distance(origin));
                        }
                    }
                }
                SkinnedBounds::BoneAggregate {
                    bones: slots.iter().copied().zip(radii).collect(),
                }
            }
            SkinnedBoundsPolicy::SourceSurfaces => {
                let sources = sources
                    .iter()
                    .filter_map(|(root, range)| {
                        let root = (*root)?;
                        let bone = bones.get(root.0)?;
                        let slice = positions.get(range.clone())?;
                        let flat: &[f32] = bytemuck::cast_slice(slice);
                        Some(SourceBounds {
                            root,
                            bind_bounds: BoundingBox::from_positions(flat),
                            inverse_bind: bone.transform.inverse(),
                        })
                    })
                    .collect();
                SkinnedBounds::SourceSurfaces { sources }
            }
        }
    }

    /// Bounds under the current bone transforms.
    pub fn refresh(&self, bones: &[Bone]) -> BoundingBox {
        let mut out = BoundingBox::EMPTY;
        match self {
            SkinnedBounds::BoneAggregate { bones: radii } => {
                for &(id, radius) in radii {
                    if let Some(p) = bone_position(bones, id) {
                        let p = [p.x as f64, p.y as f64, p.z as f64];
                        out = out.merge(&BoundingBox::from_center_extents(p, [radius as f64; 3]));
                    }
                }
            }
            SkinnedBounds::SourceSurfaces { sources } => {
                for source in sources {
                    if let Some(bone) = bones.get(source.root.0) {
                        let delta = bone.transform * source.inverse_bind;
                        out = out.merge(&source.bind_bounds.transformed(&delta));
                    }
                }
            }
        }
        if out.is_empty() {
            BoundingBox::default()
        } else {
            out
        }
    }
}
