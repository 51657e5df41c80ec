//! Incremental mesh combining.
//!
//! Source surfaces are transformed, remapped through the bake result and kept
//! in a per-destination working buffer. `add`, `remove` and `update` edit that
//! buffer; `apply` flushes it into the destination meshes in one batch.

use std::collections::HashSet;
use std::ops::Range;

use glam::{Mat3, Mat4, Vec3};
use tracing::{debug, info, warn};

use crate::atlas::uv_rect;
use crate::config::{CombineConfig, DestinationMode, ResultType};
use crate::error::{BakeError, Result, Warning};
use crate::inspect;
use crate::store::{AtlasRectRecord, BakeResult};
use crate::types::{BlendShape, Bone, BoneId, BoneWeight, BoundingBox, MeshData, Rect, Scene, Surface, SurfaceId, Topology};

use super::channels::VertexChannels;
use super::skinned::SkinnedBounds;

const DEFAULT_NORMAL: [f32; 3] = [0.0, 0.0, 1.0];
const DEFAULT_TANGENT: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
const DEFAULT_UV: [f32; 2] = [0.0, 0.0];
const DEFAULT_COLOR: [f32; 4] = [1.0; 4];
const DEFAULT_SLICE: [f32; 1] = [0.0];

/// Outcome of one [`MeshCombiner::add`].
#[derive(Debug, Clone, Default)]
pub struct CombineReport {
    pub added: Vec<SurfaceId>,
    /// Already present; `add` leaves them untouched.
    pub skipped: Vec<SurfaceId>,
    pub destinations: usize,
    pub warnings: Vec<Warning>,
}

/// Transformed and remapped vertex data of one source surface.
#[derive(Debug, Clone)]
struct Piece {
    surface: SurfaceId,
    topology: Topology,
    /// Destination submesh and source-local triangle indices.
    triangles: Vec<(usize, Vec<u32>)>,
    positions: Vec<f32>,
    normals: Vec<f32>,
    tangents: Vec<f32>,
    uvs: Vec<f32>,
    uvs2: Vec<f32>,
    colors: Vec<f32>,
    slices: Vec<f32>,
    /// `bones` hold scene bone indices until appended.
    weights: Vec<BoneWeight>,
    blend_shapes: Vec<BlendShape>,
    root_bone: Option<BoneId>,
}

#[derive(Debug, Clone)]
struct Entry {
    surface: SurfaceId,
    vertex_start: usize,
    vertex_count: usize,
    topology: Topology,
    triangles: Vec<(usize, Vec<u32>)>,
    blend_shapes: Vec<BlendShape>,
    root_bone: Option<BoneId>,
}

impl Entry {
    fn range(&self) -> Range<usize> {
        self.vertex_start..self.vertex_start + self.vertex_count
    }
}

/// One output mesh and the working buffer it is flushed from.
#[derive(Debug, Clone)]
pub struct DestinationMesh {
    pub name: String,
    /// Geometry as of the last `apply`.
    pub mesh: MeshData,
    pub bounds: BoundingBox,
    /// Scene bones addressed by `mesh.bone_weights`, in slot order.
    pub bones: Vec<BoneId>,
    working: MeshData,
    entries: Vec<Entry>,
    pending: VertexChannels,
    rebuild: bool,
    skin: Option<SkinnedBounds>,
}

fn append_channel(buf: &mut Vec<f32>, src: &[f32], existing: usize, count: usize, default: &[f32]) {
    let stride = default.len();
    let src = if src.len() == count * stride { src } else { &[] };
    if src.is_empty() && buf.is_empty() {
        return;
    }
    if buf.is_empty() {
        for _ in 0..existing {
            buf.extend_from_slice(default);
        }
    }
    if src.is_empty() {
        for _ in 0..count {
            buf.extend_from_slice(default);
        }
    } else {
        buf.extend_from_slice(src);
    }
}

fn drain_channel<T>(buf: &mut Vec<T>, range: &Range<usize>, stride: usize) {
    if !buf.is_empty() {
        buf.drain(range.start * stride..range.end * stride);
    }
}

/// Overwrite a vertex range in place. False when the channel is absent on either side.
fn write_channel<T: Copy>(buf: &mut [T], src: &[T], range: &Range<usize>, stride: usize) -> bool {
    let dst = range.start * stride..range.end * stride;
    if buf.len() < dst.end || src.len() != dst.len() {
        return false;
    }
    buf[dst].copy_from_slice(src);
    true
}

fn slot_of(bones: &mut Vec<BoneId>, bone: BoneId) -> u32 {
    match bones.iter().position(|&b| b == bone) {
        Some(i) => i as u32,
        None => {
            bones.push(bone);
            (bones.len() - 1) as u32
        }
    }
}

fn to_slots(bones: &mut Vec<BoneId>, weights: &[BoneWeight]) -> Vec<BoneWeight> {
    weights
        .iter()
        .map(|bw| {
            let mut out = *bw;
            for (b, &w) in out.bones.iter_mut().zip(&bw.weights) {
                *b = if w > 0.0 { slot_of(bones, BoneId(*b as usize)) } else { 0 };
            }
            out
        })
        .collect()
}

impl DestinationMesh {
    fn new(name: String) -> Self {
        Self {
            name,
            mesh: MeshData::default(),
            bounds: BoundingBox::default(),
            bones: Vec::new(),
            working: MeshData::default(),
            entries: Vec::new(),
            pending: VertexChannels::empty(),
            rebuild: false,
            skin: None,
        }
    }

    /// Vertices in the working buffer, including unapplied edits.
    pub fn vertex_count(&self) -> usize {
        self.working.vertex_count()
    }

    pub fn surfaces(&self) -> impl Iterator<Item = SurfaceId> + '_ {
        self.entries.iter().map(|e| e.surface)
    }

    pub fn contains(&self, id: SurfaceId) -> bool {
        self.entries.iter().any(|e| e.surface == id)
    }

    /// Vertices of `id` inside the working buffer.
    pub fn vertex_range(&self, id: SurfaceId) -> Option<Range<usize>> {
        self.entries.iter().find(|e| e.surface == id).map(Entry::range)
    }

    pub fn is_skinned(&self) -> bool {
        self.skin.is_some()
    }

    fn append(&mut self, piece: Piece) {
        let start = self.working.vertex_count();
        let count = piece.topology.vertex_count;
        let weights = to_slots(&mut self.bones, &piece.weights);
        let w = &mut self.working;
        w.positions.extend_from_slice(&piece.positions);
        append_channel(&mut w.normals, &piece.normals, start, count, &DEFAULT_NORMAL);
        append_channel(&mut w.tangents, &piece.tangents, start, count, &DEFAULT_TANGENT);
        append_channel(&mut w.uvs, &piece.uvs, start, count, &DEFAULT_UV);
        append_channel(&mut w.uvs2, &piece.uvs2, start, count, &DEFAULT_UV);
        append_channel(&mut w.colors, &piece.colors, start, count, &DEFAULT_COLOR);
        append_channel(&mut w.texture_slices, &piece.slices, start, count, &DEFAULT_SLICE);
        if !weights.is_empty() || !w.bone_weights.is_empty() {
            if w.bone_weights.is_empty() {
                w.bone_weights.resize(start, BoneWeight::default());
            }
            if weights.len() == count {
                w.bone_weights.extend(weights);
            } else {
                w.bone_weights.resize(start + count, BoneWeight::default());
            }
        }
        self.entries.push(Entry {
            surface: piece.surface,
            vertex_start: start,
            vertex_count: count,
            topology: piece.topology,
            triangles: piece.triangles,
            blend_shapes: piece.blend_shapes,
            root_bone: piece.root_bone,
        });
        self.rebuild = true;
    }

    fn remove(&mut self, id: SurfaceId) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.surface == id) else {
            return false;
        };
        let entry = self.entries.remove(pos);
        let range = entry.range();
        let w = &mut self.working;
        drain_channel(&mut w.positions, &range, 3);
        drain_channel(&mut w.normals, &range, 3);
        drain_channel(&mut w.tangents, &range, 4);
        drain_channel(&mut w.uvs, &range, 2);
        drain_channel(&mut w.uvs2, &range, 2);
        drain_channel(&mut w.colors, &range, 4);
        drain_channel(&mut w.texture_slices, &range, 1);
        drain_channel(&mut w.bone_weights, &range, 1);
        for e in &mut self.entries[pos..] {
            e.vertex_start -= entry.vertex_count;
        }
        self.rebuild = true;
        true
    }

    fn overwrite(&mut self, piece: &Piece, channels: VertexChannels) {
        let Some(pos) = self.entries.iter().position(|e| e.surface == piece.surface) else {
            return;
        };
        let range = self.entries[pos].range();
        let weights = to_slots(&mut self.bones, &piece.weights);
        let w = &mut self.working;
        let mut written = VertexChannels::empty();
        let mut write = |flag: VertexChannels, ok: bool| {
            if ok {
                written |= flag;
            }
        };
        if channels.contains(VertexChannels::POSITION) {
            write(VertexChannels::POSITION, write_channel(&mut w.positions, &piece.positions, &range, 3));
        }
        if channels.contains(VertexChannels::NORMAL) {
            write(VertexChannels::NORMAL, write_channel(&mut w.normals, &piece.normals, &range, 3));
        }
        if channels.contains(VertexChannels::TANGENT) {
            write(VertexChannels::TANGENT, write_channel(&mut w.tangents, &piece.tangents, &range, 4));
        }
        if channels.contains(VertexChannels::UV0) {
            let uv = write_channel(&mut w.uvs, &piece.uvs, &range, 2);
            let slices = write_channel(&mut w.texture_slices, &piece.slices, &range, 1);
            write(VertexChannels::UV0, uv || slices);
        }
        if channels.contains(VertexChannels::UV1) {
            write(VertexChannels::UV1, write_channel(&mut w.uvs2, &piece.uvs2, &range, 2));
        }
        if channels.contains(VertexChannels::COLOR) {
            write(VertexChannels::COLOR, write_channel(&mut w.colors, &piece.colors, &range, 4));
        }
        if channels.contains(VertexChannels::SKIN_WEIGHTS) {
            write(VertexChannels::SKIN_WEIGHTS, write_channel(&mut w.bone_weights, &weights, &range, 1));
        }
        if channels.contains(VertexChannels::BLEND_SHAPES) {
            self.entries[pos].blend_shapes = piece.blend_shapes.clone();
            written |= VertexChannels::BLEND_SHAPES;
        }
        let skipped = channels.difference(written);
        if !skipped.is_empty() {
            debug!(surface = %piece.surface, channels = ?skipped, "Channels absent from destination, not updated");
        }
        self.pending |= written;
    }

    fn blend_shapes(&self) -> Vec<BlendShape> {
        let mut out = Vec::new();
        for e in &self.entries {
            for shape in &e.blend_shapes {
                let mut s = shape.clone();
                s.vertex_start += e.vertex_start;
                out.push(s);
            }
        }
        out
    }

    fn assemble(&self, submesh_count: usize) -> MeshData {
        let mut mesh = self.working.clone();
        mesh.submeshes = vec![Vec::new(); submesh_count];
        for e in &self.entries {
            let offset = e.vertex_start as u32;
            for (sub, tris) in &e.triangles {
                if let Some(list) = mesh.submeshes.get_mut(*sub) {
                    list.extend(tris.iter().map(|&i| i + offset));
                }
            }
        }
        mesh.blend_shapes = self.blend_shapes();
        mesh
    }

    fn flush(&mut self, channels: VertexChannels, submesh_count: usize, config: &CombineConfig, bones: &[Bone]) {
        if self.rebuild {
            self.mesh = self.assemble(submesh_count);
            self.rebuild = false;
            self.pending = VertexChannels::empty();
        } else {
            let due = channels & self.pending;
            let (m, w) = (&mut self.mesh, &self.working);
            if due.contains(VertexChannels::POSITION) {
                m.positions.clone_from(&w.positions);
            }
            if due.contains(VertexChannels::NORMAL) {
                m.normals.clone_from(&w.normals);
            }
            if due.contains(VertexChannels::TANGENT) {
                m.tangents.clone_from(&w.tangents);
            }
            if due.contains(VertexChannels::UV0) {
                m.uvs.clone_from(&w.uvs);
                m.texture_slices.clone_from(&w.texture_slices);
            }
            if due.contains(VertexChannels::UV1) {
                m.uvs2.clone_from(&w.uvs2);
            }
            if due.contains(VertexChannels::COLOR) {
                m.colors.clone_from(&w.colors);
            }
            if due.contains(VertexChannels::SKIN_WEIGHTS) {
                m.bone_weights.clone_from(&w.bone_weights);
            }
            if due.contains(VertexChannels::BLEND_SHAPES) {
                self.mesh.blend_shapes = self.blend_shapes();
            }
            self.pending.remove(due);
        }

        if config.skip_bounds_recompute {
            return;
        }
        if self.mesh.is_skinned() {
            let sources: Vec<_> = self.entries.iter().map(|e| (e.root_bone, e.range())).collect();
            let skin = SkinnedBounds::capture(config.skinned_bounds, &self.mesh, &self.bones, &sources, bones);
            self.bounds = skin.refresh(bones);
            self.skin = Some(skin);
        } else {
            self.skin = None;
            self.bounds = if self.mesh.is_empty() {
                BoundingBox::default()
            } else {
                BoundingBox::from_positions(&self.mesh.positions)
            };
        }
    }
}

/// Merges the surfaces of one cluster into one or more destination meshes.
pub struct MeshCombiner {
    name: String,
    config: CombineConfig,
    result: BakeResult,
    mode: DestinationMode,
    destinations: Vec<DestinationMesh>,
    /// Suffix for the next extra destination; never reused after a removal.
    next_destination: usize,
}

impl MeshCombiner {
    /// A combiner remapping UVs through `result`.
    pub fn new(name: impl Into<String>, result: BakeResult, config: CombineConfig) -> Result<Self> {
        config.validate()?;
        result.validate()?;
        let name = name.into();
        Ok(Self {
            mode: config.destination_mode,
            destinations: vec![DestinationMesh::new(name.clone())],
            next_destination: 1,
            name,
            config,
            result,
        })
    }

    /// Override the destination mode, typically with [`CombineConfig::mode_for_estimate`].
    pub fn with_mode(mut self, mode: DestinationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> DestinationMode {
        self.mode
    }

    pub fn destinations(&self) -> &[DestinationMesh] {
        &self.destinations
    }

    pub fn result(&self) -> &BakeResult {
        &self.result
    }

    pub fn contains(&self, id: SurfaceId) -> bool {
        self.destinations.iter().any(|d| d.contains(id))
    }

    pub fn surface_count(&self) -> usize {
        self.destinations.iter().map(|d| d.entries.len()).sum()
    }

    pub fn vertex_count(&self) -> usize {
        self.destinations.iter().map(DestinationMesh::vertex_count).sum()
    }

    /// Append surfaces to the working buffer.
    ///
    /// Every input is validated before anything is touched; on error the
    /// combiner and the scene are unchanged. Surfaces already present are
    /// skipped. With `disable_source_rendering` the sources are hidden once
    /// the merge succeeded.
    pub fn add(&mut self, scene: &mut Scene, ids: &[SurfaceId], disable_source_rendering: bool) -> Result<CombineReport> {
        let mut report = CombineReport::default();
        let mut seen = HashSet::new();
        let mut pieces = Vec::with_capacity(ids.len());
        for (index, &id) in ids.iter().enumerate() {
            if !seen.insert(id) {
                return Err(BakeError::input(index, id.to_string(), "surface appears twice in the input"));
            }
            let surface = scene
                .surface(id)
                .ok_or_else(|| BakeError::input(index, id.to_string(), "surface not found in scene"))?;
            if self.contains(id) {
                debug!(surface = %surface.label(), "Already combined, skipping");
                report.skipped.push(id);
                continue;
            }
            let (piece, warnings) = self.extract(scene, index, surface, self.config.channels)?;
            report.warnings.extend(warnings);
            pieces.push(piece);
        }

        let targets = match self.plan_destinations(&pieces, self.mode) {
            Ok(t) => t,
            Err(BakeError::CapacityOverflow { count, limit }) if self.mode == DestinationMode::Auto => {
                info!(
                    combiner = %self.name,
                    vertices = count,
                    limit,
                    "Vertex limit exceeded, promoting to multiple destination meshes"
                );
                let t = self.plan_destinations(&pieces, DestinationMode::Multi)?;
                self.mode = DestinationMode::Multi;
                t
            }
            Err(e) => return Err(e),
        };

        for (piece, target) in pieces.into_iter().zip(targets) {
            if target == self.destinations.len() {
                let name = format!("{}-{}", self.name, self.next_destination);
                self.next_destination += 1;
                self.destinations.push(DestinationMesh::new(name));
            }
            report.added.push(piece.surface);
            self.destinations[target].append(piece);
        }

        if disable_source_rendering {
            for &id in &report.added {
                if let Some(s) = scene.surface_mut(id) {
                    s.rendering_enabled = false;
                }
            }
        }

        report.destinations = self.destinations.len();
        info!(
            combiner = %self.name,
            added = report.added.len(),
            skipped = report.skipped.len(),
            destinations = report.destinations,
            vertices = self.vertex_count(),
            "Surfaces combined"
        );
        Ok(report)
    }

    /// Drop surfaces by id. Unknown ids are ignored. Returns how many were removed.
    pub fn remove(&mut self, ids: &[SurfaceId]) -> usize {
        let mut removed = 0;
        for &id in ids {
            if self.destinations.iter_mut().any(|d| d.remove(id)) {
                removed += 1;
            }
        }
        // Keep the first destination even when empty
        let mut first = true;
        self.destinations.retain(|d| std::mem::take(&mut first) || !d.entries.is_empty());
        debug!(combiner = %self.name, removed, remaining = self.surface_count(), "Surfaces removed");
        removed
    }

    /// Re-read `channels` of already combined surfaces in place.
    ///
    /// The vertex and triangle layout must match the last `add`.
    pub fn update(&mut self, scene: &Scene, ids: &[SurfaceId], channels: VertexChannels) -> Result<()> {
        let channels = channels & self.config.channels;
        let mut seen = HashSet::new();
        let mut pieces = Vec::with_capacity(ids.len());
        for (index, &id) in ids.iter().enumerate() {
            if !seen.insert(id) {
                return Err(BakeError::input(index, id.to_string(), "surface appears twice in the input"));
            }
            let surface = scene
                .surface(id)
                .ok_or_else(|| BakeError::input(index, id.to_string(), "surface not found in scene"))?;
            let Some(entry) = self.destinations.iter().flat_map(|d| &d.entries).find(|e| e.surface == id) else {
                return Err(BakeError::input(index, surface.label(), "surface was never added"));
            };
            let topology = inspect::mesh(scene, surface).map(MeshData::topology);
            if topology.as_ref() != Some(&entry.topology) {
                return Err(BakeError::TopologyMismatch {
                    surface: surface.label(),
                    reason: match topology {
                        Some(t) => format!(
                            "added with {} vertices and triangles {:?}, now {} and {:?}",
                            entry.topology.vertex_count,
                            entry.topology.submesh_triangles,
                            t.vertex_count,
                            t.submesh_triangles
                        ),
                        None => "mesh was removed".to_string(),
                    },
                });
            }
            let (piece, _) = self.extract(scene, index, surface, channels)?;
            pieces.push(piece);
        }

        for piece in &pieces {
            for dest in &mut self.destinations {
                if dest.contains(piece.surface) {
                    dest.overwrite(piece, channels);
                }
            }
        }
        debug!(combiner = %self.name, surfaces = pieces.len(), channels = ?channels, "Channels updated");
        Ok(())
    }

    /// Flush pending edits of `channels` into the destination meshes and
    /// recompute their bounds.
    ///
    /// Adds and removes always rebuild the affected mesh completely.
    pub fn apply(&mut self, channels: VertexChannels, bones: &[Bone]) -> &[DestinationMesh] {
        let submesh_count = self.result.result_materials.len();
        for dest in &mut self.destinations {
            dest.flush(channels, submesh_count, &self.config, bones);
        }
        &self.destinations
    }

    /// Move skinned destination bounds to the current bone pose.
    pub fn refresh_skinned_bounds(&mut self, bones: &[Bone]) {
        for dest in &mut self.destinations {
            if let Some(skin) = &dest.skin {
                dest.bounds = skin.refresh(bones);
            }
        }
    }

    /// Destination index for every piece; `len()` means "open a new one".
    fn plan_destinations(&self, pieces: &[Piece], mode: DestinationMode) -> Result<Vec<usize>> {
        let limit = self.config.max_vertices_per_mesh;
        let mut loads: Vec<usize> = self.destinations.iter().map(DestinationMesh::vertex_count).collect();
        let projected = self.vertex_count() + pieces.iter().map(|p| p.topology.vertex_count).sum::<usize>();
        let mut targets = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let n = piece.topology.vertex_count;
            if n > limit {
                return Err(BakeError::CapacityOverflow { count: n, limit });
            }
            let last = loads.len() - 1;
            if loads[last] + n <= limit {
                loads[last] += n;
                targets.push(last);
            } else if mode == DestinationMode::Multi {
                loads.push(n);
                targets.push(loads.len() - 1);
            } else {
                return Err(BakeError::CapacityOverflow {
                    count: projected,
                    limit,
                });
            }
        }
        Ok(targets)
    }

    /// Validate one surface and produce its transformed, remapped data.
    fn extract(
        &self,
        scene: &Scene,
        index: usize,
        surface: &Surface,
        channels: VertexChannels,
    ) -> Result<(Piece, Vec<Warning>)> {
        let label = surface.label();
        let mesh = inspect::mesh(scene, surface).ok_or_else(|| BakeError::input(index, &label, "surface has no mesh"))?;
        let materials = inspect::materials(surface);
        if materials.is_empty() {
            return Err(BakeError::input(index, &label, "surface has no material"));
        }
        if mesh.is_empty() || mesh.submeshes.is_empty() {
            return Err(BakeError::input(index, &label, "mesh has no geometry"));
        }
        let vertex_count = mesh.vertex_count();
        if let Some(bad) = mesh.submeshes.iter().flatten().find(|&&i| i as usize >= vertex_count) {
            return Err(BakeError::input(
                index,
                &label,
                format!("index {bad} out of range for {vertex_count} vertices"),
            ));
        }

        let mut warnings = Vec::new();
        if self.config.robust_validation {
            let pairs = inspect::overlapping_submeshes(mesh);
            if !pairs.is_empty() {
                warn!(surface = %label, pairs = ?pairs, "Submeshes share vertices; UV remapping may corrupt one of them");
                warnings.push(Warning::OverlappingSubmeshes {
                    surface: label.clone(),
                    pairs,
                });
            }
        }

        // Atlas record and cell shift per submesh slot
        let mut slots: Vec<(&AtlasRectRecord, [f64; 2])> = Vec::with_capacity(mesh.submeshes.len());
        let mut triangles = Vec::with_capacity(mesh.submeshes.len());
        for (slot, indices) in mesh.submeshes.iter().enumerate() {
            let material = materials[slot.min(materials.len() - 1)];
            let record = self.result.rect_for(material).ok_or_else(|| {
                BakeError::MaterialMapping(format!("{material} used by {label} has no atlas rect in this bake"))
            })?;
            let (submesh, _) = self.result.result_material_for(material).ok_or_else(|| {
                BakeError::MaterialMapping(format!("{material} used by {label} has no result material"))
            })?;
            let uv_bounds = uv_rect::mesh_uv_bounds(mesh, Some(slot));
            let user = match uv_bounds {
                Some(r) if record.consider_surface_uvs => r,
                _ => Rect::UNIT,
            };
            let shift = uv_rect::cell_shift(&uv_rect::transform_rect(&user, &record.material_tiling_rect));
            if let Some(actual) = uv_bounds {
                let candidate =
                    uv_rect::normalize_to_first_cell(&uv_rect::transform_rect(&actual, &record.material_tiling_rect));
                if !uv_rect::is_enclosed(record.tiling_treatment, &record.sampling_rect, &candidate) {
                    warn!(surface = %label, %material, "UVs sample outside the baked region");
                    warnings.push(Warning::NotEnclosed {
                        surface: label.clone(),
                        material: material.to_string(),
                    });
                }
            }
            slots.push((record, shift));
            triangles.push((submesh, indices.clone()));
        }

        // First submesh referencing a vertex decides its remap
        let mut owner: Vec<Option<usize>> = vec![None; vertex_count];
        for (slot, indices) in mesh.submeshes.iter().enumerate() {
            for &i in indices {
                owner[i as usize].get_or_insert(slot);
            }
        }

        let transform = if self.config.bake_world_space {
            surface.transform
        } else {
            Mat4::IDENTITY
        };
        let linear = Mat3::from_mat4(transform);
        let normal_matrix = if linear.determinant().abs() > f32::EPSILON {
            linear.inverse().transpose()
        } else {
            linear
        };

        let positions = transform_points(&mesh.positions, &transform);
        let wants = |c: VertexChannels| channels.contains(c);
        let has = |buf: &Vec<f32>, stride: usize| buf.len() == vertex_count * stride;

        let normals = if wants(VertexChannels::NORMAL) && has(&mesh.normals, 3) {
            transform_directions(&mesh.normals, 3, &normal_matrix, true)
        } else {
            Vec::new()
        };
        let tangents = if wants(VertexChannels::TANGENT) && has(&mesh.tangents, 4) {
            transform_directions(&mesh.tangents, 4, &linear, true)
        } else {
            Vec::new()
        };

        let (uvs, slices) = if wants(VertexChannels::UV0) {
            let uvs = if has(&mesh.uvs, 2) {
                mesh.uvs
                    .chunks_exact(2)
                    .zip(&owner)
                    .flat_map(|(uv, slot)| {
                        let uv = [uv[0], uv[1]];
                        match slot {
                            Some(s) => {
                                let (rec, shift) = slots[*s];
                                uv_rect::remap_uv(uv, &rec.material_tiling_rect, shift, &rec.sampling_rect, &rec.dest_rect)
                            }
                            None => uv,
                        }
                    })
                    .collect()
            } else {
                Vec::new()
            };
            let slices = if self.result.result_type == ResultType::TextureArray {
                owner
                    .iter()
                    .map(|slot| slot.map_or(0.0, |s| slots[s].0.texture_array_slice_index.max(0) as f32))
                    .collect()
            } else {
                Vec::new()
            };
            (uvs, slices)
        } else {
            (Vec::new(), Vec::new())
        };

        let uvs2 = if wants(VertexChannels::UV1) && has(&mesh.uvs2, 2) {
            mesh.uvs2.clone()
        } else {
            Vec::new()
        };
        let colors = if wants(VertexChannels::COLOR) && has(&mesh.colors, 4) {
            mesh.colors.clone()
        } else {
            Vec::new()
        };

        let skinned = inspect::is_skinned(scene, surface) && mesh.bone_weights.len() == vertex_count;
        let weights = if wants(VertexChannels::SKIN_WEIGHTS) && skinned {
            let skin = inspect::skin_bones(surface);
            let mut out = Vec::with_capacity(vertex_count);
            for bw in &mesh.bone_weights {
                let mut mapped = *bw;
                for (b, &w) in mapped.bones.iter_mut().zip(&bw.weights) {
                    if w <= 0.0 {
                        continue;
                    }
                    let bone = skin.get(*b as usize).ok_or_else(|| {
                        BakeError::input(
                            index,
                            &label,
                            format!("bone weight uses slot {b} but the surface has {} bones", skin.len()),
                        )
                    })?;
                    *b = bone.0 as u32;
                }
                out.push(mapped);
            }
            out
        } else {
            Vec::new()
        };

        let blend_shapes = if wants(VertexChannels::BLEND_SHAPES) {
            mesh.blend_shapes
                .iter()
                .map(|shape| BlendShape {
                    name: shape.name.clone(),
                    vertex_start: shape.vertex_start,
                    delta_positions: transform_directions(&shape.delta_positions, 3, &linear, false),
                    delta_normals: transform_directions(&shape.delta_normals, 3, &normal_matrix, false),
                })
                .collect()
        } else {
            Vec::new()
        };

        let piece = Piece {
            surface: surface.id,
            topology: mesh.topology(),
            triangles,
            positions,
            normals,
            tangents,
            uvs,
            uvs2,
            colors,
            slices,
            weights,
            blend_shapes,
            root_bone: surface.root_bone.or_else(|| surface.bones.first().copied()),
        };
        Ok((piece, warnings))
    }
}

fn transform_points(positions: &[f32], m: &Mat4) -> Vec<f32> {
    if *m == Mat4::IDENTITY {
        return positions.to_vec();
    }
    positions
        .chunks_exact(3)
        .flat_map(|p| m.transform_point3(Vec3::from_slice(p)).to_array())
        .collect()
}

/// Transform the xyz part of each `stride`-wide element; a fourth component passes through.
fn transform_directions(values: &[f32], stride: usize, m: &Mat3, normalize: bool) -> Vec<f32> {
    let mut out = Vec::with_capacity(values.len());
    for chunk in values.chunks_exact(stride) {
        let v = *m * Vec3::from_slice(chunk);
        let v = if normalize { v.normalize_or_zero() } else { v };
        out.extend_from_slice(&v.to_array());
        out.extend_from_slice(&chunk[3..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::bake::test_support::{add_material, add_surface, quad};
    use crate::atlas::bake_cluster;
    use crate::config::BakeConfig;
    use crate::types::MaterialId;
    use approx::assert_abs_diff_eq;

    /// Two quads with their own materials, baked into one atlas.
    fn baked_scene() -> (Scene, Vec<SurfaceId>, BakeResult) {
        let mut scene = Scene::default();
        let a = add_material(&mut scene, "a", 16, [255, 0, 0, 255]);
        let b = add_material(&mut scene, "b", 16, [0, 255, 0, 255]);
        let ids = vec![
            add_surface(&mut scene, 1, quad([0.0, 0.0], [1.0, 1.0]), a),
            add_surface(&mut scene, 2, quad([0.0, 0.0], [1.0, 1.0]), b),
        ];
        scene.surfaces[1].transform = Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0));
        let atlas = bake_cluster(&scene, &BakeConfig::default(), &"c".into(), &ids).unwrap();
        (scene, ids, atlas.result)
    }

    fn combiner(result: BakeResult) -> MeshCombiner {
        MeshCombiner::new("c", result, CombineConfig::default()).unwrap()
    }

    #[test]
    fn add_merges_and_remaps() {
        let (mut scene, ids, result) = baked_scene();
        let dest_a = result.rect_for(MaterialId(0)).unwrap().dest_rect;
        let mut c = combiner(result);
        let report = c.add(&mut scene, &ids, true).unwrap();
        assert_eq!(report.added, ids);
        assert!(scene.surfaces.iter().all(|s| !s.rendering_enabled));

        let dest = &c.apply(VertexChannels::all(), &[])[0];
        assert_eq!(dest.mesh.vertex_count(), 8);
        assert_eq!(dest.mesh.submeshes.len(), 1);
        assert_eq!(dest.mesh.triangle_count(), 4);
        // Second quad was moved into world space
        assert_eq!(dest.mesh.positions[12], 5.0);
        assert_eq!(dest.bounds.max[0], 6.0);
        // UV (1, 1) of the first quad lands on the far corner of its rect
        assert_abs_diff_eq!(dest.mesh.uvs[4] as f64, dest_a.x_max(), epsilon = 1e-6);
        assert_abs_diff_eq!(dest.mesh.uvs[5] as f64, dest_a.y_max(), epsilon = 1e-6);
    }

    #[test]
    fn duplicate_input_leaves_combiner_unchanged() {
        let (mut scene, ids, result) = baked_scene();
        let mut c = combiner(result);
        c.add(&mut scene, &ids[..1], false).unwrap();
        c.apply(VertexChannels::all(), &[]);
        let before = c.destinations()[0].mesh.clone();

        let err = c.add(&mut scene, &[ids[1], ids[1]], false).unwrap_err();
        assert!(matches!(err, BakeError::InputIntegrity { index: 1, .. }));
        assert_eq!(c.surface_count(), 1);
        c.apply(VertexChannels::all(), &[]);
        assert_eq!(c.destinations()[0].mesh, before);
    }

    #[test]
    fn add_is_idempotent() {
        let (mut scene, ids, result) = baked_scene();
        let mut c = combiner(result);
        c.add(&mut scene, &ids, false).unwrap();
        let report = c.add(&mut scene, &ids, false).unwrap();
        assert!(report.added.is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(c.vertex_count(), 8);
    }

    #[test]
    fn missing_material_record_is_mapping_error() {
        let (mut scene, ids, result) = baked_scene();
        scene.surfaces[0].materials = vec![MaterialId(9)];
        let mut c = combiner(result);
        let err = c.add(&mut scene, &ids, false).unwrap_err();
        assert!(matches!(err, BakeError::MaterialMapping(_)));
        assert_eq!(c.surface_count(), 0);
    }

    #[test]
    fn surface_without_material_rejected() {
        let (mut scene, ids, result) = baked_scene();
        scene.surfaces[1].materials.clear();
        let mut c = combiner(result);
        let err = c.add(&mut scene, &ids, false).unwrap_err();
        assert!(matches!(err, BakeError::InputIntegrity { index: 1, .. }));
    }

    #[test]
    fn single_mode_rejects_overflow() {
        let (mut scene, ids, result) = baked_scene();
        let config = CombineConfig {
            destination_mode: DestinationMode::Single,
            max_vertices_per_mesh: 6,
            ..Default::default()
        };
        let mut c = MeshCombiner::new("c", result, config).unwrap();
        let err = c.add(&mut scene, &ids, false).unwrap_err();
        assert!(matches!(err, BakeError::CapacityOverflow { count: 8, limit: 6 }));
        assert_eq!(c.surface_count(), 0);
    }

    #[test]
    fn auto_mode_promotes_on_overflow() {
        let (mut scene, ids, result) = baked_scene();
        let config = CombineConfig {
            max_vertices_per_mesh: 6,
            ..Default::default()
        };
        let mut c = MeshCombiner::new("c", result, config).unwrap();
        let report = c.add(&mut scene, &ids, false).unwrap();
        assert_eq!(c.mode(), DestinationMode::Multi);
        assert_eq!(report.destinations, 2);
        let dests = c.apply(VertexChannels::all(), &[]);
        assert!(dests.iter().all(|d| d.mesh.vertex_count() <= 6));
        assert_eq!(dests[1].name, "c-1");
    }

    #[test]
    fn destination_names_stay_unique_after_remove() {
        let mut scene = Scene::default();
        let ids: Vec<SurfaceId> = (0..4)
            .map(|i| {
                let m = add_material(&mut scene, &format!("m{i}"), 8, [i as u8 * 50, 0, 0, 255]);
                add_surface(&mut scene, i as u64 + 1, quad([0.0, 0.0], [1.0, 1.0]), m)
            })
            .collect();
        let atlas = bake_cluster(&scene, &BakeConfig::default(), &"c".into(), &ids).unwrap();
        let config = CombineConfig {
            destination_mode: DestinationMode::Multi,
            max_vertices_per_mesh: 4,
            ..Default::default()
        };
        let mut c = MeshCombiner::new("c", atlas.result, config).unwrap();

        for &id in &ids[..3] {
            c.add(&mut scene, &[id], false).unwrap();
        }
        assert_eq!(c.destinations().len(), 3);
        assert_eq!(c.remove(&[ids[1]]), 1);
        assert_eq!(c.destinations().len(), 2);
        c.add(&mut scene, &[ids[3]], false).unwrap();

        let names: Vec<&str> = c.destinations().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["c", "c-2", "c-3"]);
        let unique: std::collections::BTreeSet<&str> = names.iter().copied().collect();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn remove_keeps_other_geometry() {
        let (mut scene, ids, result) = baked_scene();
        let mut c = combiner(result);
        c.add(&mut scene, &ids, false).unwrap();
        let before = c.apply(VertexChannels::all(), &[])[0].mesh.clone();
        let second: Vec<f32> = before.positions[12..24].to_vec();

        assert_eq!(c.remove(&[ids[0], SurfaceId(99)]), 1);
        let after = &c.apply(VertexChannels::all(), &[])[0];
        assert_eq!(after.mesh.vertex_count(), 4);
        assert_eq!(after.mesh.positions, second);
        assert_eq!(after.mesh.uvs, before.uvs[8..16].to_vec());
        assert_eq!(after.mesh.submeshes[0], vec![0, 1, 2, 0, 2, 3]);
        assert_eq!(after.bounds.min[0], 5.0);
    }

    #[test]
    fn update_overwrites_only_requested_channels() {
        let (mut scene, ids, result) = baked_scene();
        let mut c = combiner(result);
        c.add(&mut scene, &ids, false).unwrap();
        let before = c.apply(VertexChannels::all(), &[])[0].mesh.clone();

        scene.meshes[1].positions[0] = -3.0;
        scene.meshes[1].normals[2] = -1.0;
        c.update(&scene, &[ids[1]], VertexChannels::POSITION).unwrap();
        let dest = &c.apply(VertexChannels::all(), &[])[0];
        assert_eq!(dest.mesh.positions[12], 2.0);
        assert_eq!(dest.mesh.normals, before.normals);
        assert_eq!(dest.bounds.min[0], 0.0);
    }

    #[test]
    fn update_rejects_topology_change() {
        let (mut scene, ids, result) = baked_scene();
        let mut c = combiner(result);
        c.add(&mut scene, &ids, false).unwrap();
        scene.meshes[0].submeshes[0].truncate(3);
        let err = c.update(&scene, &ids, VertexChannels::all()).unwrap_err();
        assert!(matches!(err, BakeError::TopologyMismatch { .. }));

        let err = c.update(&scene, &[SurfaceId(7)], VertexChannels::all()).unwrap_err();
        assert!(matches!(err, BakeError::InputIntegrity { .. }));
    }

    #[test]
    fn robust_mode_warns_on_shared_vertices() {
        let (mut scene, ids, result) = baked_scene();
        scene.meshes[0].submeshes = vec![vec![0, 1, 2], vec![0, 2, 3]];
        scene.surfaces[0].materials = vec![MaterialId(0), MaterialId(0)];
        let config = CombineConfig {
            robust_validation: true,
            ..Default::default()
        };
        let mut c = MeshCombiner::new("c", result, config).unwrap();
        let report = c.add(&mut scene, &ids, false).unwrap();
        assert!(matches!(
            report.warnings.as_slice(),
            [Warning::OverlappingSubmeshes { pairs, .. }] if pairs == &vec![(0, 1)]
        ));
    }

    #[test]
    fn uvs_outside_baked_region_warn() {
        let (mut scene, ids, result) = baked_scene();
        scene.meshes[0].uvs = vec![0.0, 0.0, 2.5, 0.0, 2.5, 1.0, 0.0, 1.0];
        let mut c = combiner(result);
        let report = c.add(&mut scene, &ids[..1], false).unwrap();
        assert!(matches!(report.warnings.as_slice(), [Warning::NotEnclosed { .. }]));
    }

    #[test]
    fn skinned_destination_tracks_bones() {
        let (mut scene, ids, result) = baked_scene();
        scene.bones.push(Bone {
            name: "root".into(),
            transform: Mat4::IDENTITY,
        });
        scene.meshes[0].bone_weights = vec![
            BoneWeight {
                bones: [0, 0, 0, 0],
                weights: [1.0, 0.0, 0.0, 0.0],
            };
            4
        ];
        scene.surfaces[0].bones = vec![BoneId(0)];
        let mut c = combiner(result);
        c.add(&mut scene, &ids[..1], false).unwrap();
        let dest = &c.apply(VertexChannels::all(), &scene.bones)[0];
        assert!(dest.is_skinned());
        assert_eq!(dest.bones, vec![BoneId(0)]);
        let start = dest.bounds;

        scene.bones[0].transform = Mat4::from_translation(Vec3::new(0.0, 10.0, 0.0));
        c.refresh_skinned_bounds(&scene.bones);
        let moved = c.destinations()[0].bounds;
        assert_eq!(moved.min[1], start.min[1] + 10.0);
    }
}
