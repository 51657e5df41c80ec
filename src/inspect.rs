//! Read-only accessors over scene surfaces.
//!
//! Every other component goes through these helpers rather than poking at
//! `Scene` internals, so a missing mesh or dangling material index is handled
//! in one place.

use std::collections::HashMap;

use glam::Mat4;
use rayon::prelude::*;

use crate::types::{BoneId, BoundingBox, Material, MaterialId, MeshData, Scene, Surface, SurfaceId};

/// Mesh drawn by `surface`, if it has one.
pub fn mesh<'a>(scene: &'a Scene, surface: &Surface) -> Option<&'a MeshData> {
    scene.mesh_of(surface)
}

/// Material ids in submesh-slot order.
pub fn materials(surface: &Surface) -> &[MaterialId] {
    &surface.materials
}

/// Resolve a material id against the scene's library.
pub fn material<'a>(scene: &'a Scene, id: MaterialId) -> Option<&'a Material> {
    scene.library.get(id)
}

/// Skin bones, empty for rigid surfaces.
pub fn skin_bones(surface: &Surface) -> &[BoneId] {
    &surface.bones
}

pub fn is_skinned(scene: &Scene, surface: &Surface) -> bool {
    !surface.bones.is_empty() && mesh(scene, surface).is_some_and(MeshData::is_skinned)
}

/// World-space bounds as recorded on the surface.
pub fn world_bounds(surface: &Surface) -> BoundingBox {
    surface.world_bounds
}

/// Centre of the world bounds; the point every grouping strategy clusters on.
pub fn center(surface: &Surface) -> [f64; 3] {
    surface.world_bounds.center()
}

pub fn vertex_count(scene: &Scene, surface: &Surface) -> usize {
    mesh(scene, surface).map_or(0, MeshData::vertex_count)
}

/// Sum of vertex counts over `ids`; unknown ids count as zero.
pub fn estimate_vertex_count(scene: &Scene, ids: &[SurfaceId]) -> usize {
    ids.iter()
        .filter_map(|&id| scene.surface(id))
        .map(|s| vertex_count(scene, s))
        .sum()
}

/// Bounds of the mesh's positions under `transform`.
pub fn compute_world_bounds(mesh: &MeshData, transform: &Mat4) -> BoundingBox {
    if mesh.is_empty() {
        let origin = transform.w_axis;
        return BoundingBox {
            min: [origin.x as f64, origin.y as f64, origin.z as f64],
            max: [origin.x as f64, origin.y as f64, origin.z as f64],
        };
    }
    BoundingBox::from_positions(&mesh.positions).transformed(transform)
}

/// Recompute `world_bounds` of every surface from its mesh and transform.
///
/// Surfaces without a mesh keep whatever bounds they already carry.
pub fn refresh_world_bounds(scene: &mut Scene) {
    let meshes = &scene.meshes;
    scene.surfaces.par_iter_mut().for_each(|surface| {
        if let Some(mesh) = surface.mesh.and_then(|i| meshes.get(i)) {
            surface.world_bounds = compute_world_bounds(mesh, &surface.transform);
        }
    });
}

/// Pairs of submeshes that reference at least one common vertex.
///
/// Shared vertices get a single UV, so remapping them into two different
/// atlas rects corrupts one of the submeshes.
pub fn overlapping_submeshes(mesh: &MeshData) -> Vec<(usize, usize)> {
    let mut owner: HashMap<u32, usize> = HashMap::new();
    let mut pairs = Vec::new();
    for (sub_idx, indices) in mesh.submeshes.iter().enumerate() {
        for &vi in indices {
            match owner.get(&vi) {
                Some(&other) if other != sub_idx => {
                    if !pairs.contains(&(other, sub_idx)) {
                        pairs.push((other, sub_idx));
                    }
                }
                Some(_) => {}
                None => {
                    owner.insert(vi, sub_idx);
                }
            }
        }
    }
    pairs
}
