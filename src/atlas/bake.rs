//! Resumable texture bake.
//!
//! Every cluster goes through three phases: plan (tiling analysis, result
//! material grouping and bin packing), rasterize (one source material into
//! one property image per unit of work) and emit (building the
//! [`BakeResult`] tables). The job yields between units, so a frame budget
//! is honoured even for clusters with hundreds of materials.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use image::RgbaImage;
use tracing::{debug, info, warn};

use crate::config::{BakeConfig, PackingAlgorithm, ResultType};
use crate::error::{BakeError, Result, Warning};
use crate::grouping::{ClusterKey, ClusterMap};
use crate::inspect;
use crate::schedule::{self, CancelToken, FrameBudget, Resumable, StepStatus};
use crate::store::{AtlasPage, AtlasRectRecord, BakeResult, ResultMaterialMapping, TextureArraySliceTable};
use crate::types::{Material, MaterialId, Rect, Scene, SurfaceId};

use super::packer::{self, Layout, PackItem, PackLimits, Placement};
use super::texture;
use super::uv_rect::{self, TilingInfo, TilingTreatment};

/// Property baked when no material in a cluster has any texture slot.
pub const DEFAULT_PROPERTY: &str = "_MainTex";

/// Texture output of one cluster.
#[derive(Debug, Clone)]
pub struct ClusterAtlas {
    pub cluster: ClusterKey,
    pub result: BakeResult,
    pub pages: Vec<AtlasPage>,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone)]
struct MaterialEntry {
    id: MaterialId,
    info: TilingInfo,
    /// Capture size in pixels before any downscale.
    width: u32,
    height: u32,
    /// Forced to oversampling because its page could not wrap.
    demoted: bool,
}

/// One result material: a packed atlas page or a texture array.
#[derive(Debug, Clone)]
struct PagePlan {
    result_material: String,
    width: u32,
    height: u32,
    /// `key` indexes `ClusterPlan::materials`.
    placements: Vec<Placement>,
    array: bool,
}

#[derive(Debug, Clone)]
struct ClusterPlan {
    key: ClusterKey,
    materials: Vec<MaterialEntry>,
    properties: Vec<String>,
    pages: Vec<PagePlan>,
    warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Copy)]
struct RasterUnit {
    page: usize,
    property: usize,
    placement: usize,
}

enum Phase {
    Plan,
    Rasterize {
        plan: ClusterPlan,
        pages: Vec<AtlasPage>,
        units: Vec<RasterUnit>,
        next: usize,
    },
    Emit {
        plan: ClusterPlan,
        pages: Vec<AtlasPage>,
    },
    Done,
}

/// Texture bake over every cluster of a grouping, as a resumable job.
pub struct TextureBakeJob<'a> {
    scene: &'a Scene,
    config: &'a BakeConfig,
    clusters: Vec<(ClusterKey, Vec<SurfaceId>)>,
    cursor: usize,
    phase: Phase,
    decoded: HashMap<usize, Option<RgbaImage>>,
    finished: Vec<ClusterAtlas>,
    cancel: CancelToken,
    error: Option<BakeError>,
}

impl<'a> TextureBakeJob<'a> {
    /// Validates the texture-side configuration up front.
    pub fn new(scene: &'a Scene, config: &'a BakeConfig, clusters: &ClusterMap, cancel: CancelToken) -> Result<Self> {
        config.packing.validate()?;
        config.tiling.validate()?;
        let clusters: Vec<_> = clusters.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let phase = if clusters.is_empty() { Phase::Done } else { Phase::Plan };
        Ok(Self {
            scene,
            config,
            clusters,
            cursor: 0,
            phase,
            decoded: HashMap::new(),
            finished: Vec::new(),
            cancel,
            error: None,
        })
    }

    /// Clusters finished so far and the total.
    pub fn progress(&self) -> (usize, usize) {
        (self.finished.len(), self.clusters.len())
    }

    /// Advance by one unit of work.
    fn advance(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Plan => {
                let (key, members) = &self.clusters[self.cursor];
                let plan = plan_cluster(self.scene, self.config, key, members)?;
                let pages = allocate_pages(&plan);
                let units = raster_units(&plan);
                debug!(
                    cluster = %plan.key,
                    pages = plan.pages.len(),
                    units = units.len(),
                    "Cluster atlas planned"
                );
                self.phase = Phase::Rasterize {
                    plan,
                    pages,
                    units,
                    next: 0,
                };
            }
            Phase::Rasterize {
                mut plan,
                mut pages,
                units,
                next,
            } => {
                if let Some(unit) = units.get(next).copied() {
                    self.rasterize(&mut plan, &mut pages, unit)?;
                    self.phase = Phase::Rasterize {
                        plan,
                        pages,
                        units,
                        next: next + 1,
                    };
                } else {
                    self.phase = Phase::Emit { plan, pages };
                }
            }
            Phase::Emit { plan, pages } => {
                let atlas = emit(plan, pages, self.config)?;
                info!(
                    cluster = %atlas.cluster,
                    materials = atlas.result.atlas_rects.len(),
                    result_materials = atlas.result.result_materials.len(),
                    warnings = atlas.warnings.len(),
                    "Cluster atlas baked"
                );
                self.finished.push(atlas);
                self.cursor += 1;
                self.phase = if self.cursor < self.clusters.len() {
                    Phase::Plan
                } else {
                    Phase::Done
                };
            }
            Phase::Done => {}
        }
        Ok(())
    }

    fn source_image(&mut self, texture_index: usize) -> Option<&RgbaImage> {
        let library = &self.scene.library;
        self.decoded
            .entry(texture_index)
            .or_insert_with(|| {
                let tex = library.texture(texture_index)?;
                match texture::decode_texture(tex) {
                    Ok(img) => Some(img),
                    Err(e) => {
                        warn!(texture = texture_index, error = %e, "Falling back to placeholder");
                        None
                    }
                }
            })
            .as_ref()
    }

    fn rasterize(&mut self, plan: &mut ClusterPlan, pages: &mut [AtlasPage], unit: RasterUnit) -> Result<()> {
        let scene = self.scene;
        let page_plan = &plan.pages[unit.page];
        let placement = page_plan.placements[unit.placement];
        let array = page_plan.array;
        let entry = &plan.materials[placement.key];
        let property = plan.properties[unit.property].clone();
        let material = scene
            .library
            .get(entry.id)
            .ok_or_else(|| BakeError::MaterialMapping(format!("{} disappeared from the library", entry.id)))?;
        let sampling = entry.info.sampling;
        let material_name = material_label(material, entry.id);
        let color = texture::placeholder_color(material, &property);
        let texture_index = material.textures.get(&property).and_then(|slot| slot.texture);
        let placeholder_size = self.config.packing.placeholder_size;
        let algorithm = self.config.packing.algorithm;
        let padding = self.config.packing.padding;

        let decoded = match texture_index {
            Some(i) => self.source_image(i),
            None => None,
        };
        let fallback;
        let source = match decoded {
            Some(img) => img,
            None => {
                let missing = Warning::MissingTexture {
                    material: material_name,
                    property: property.clone(),
                };
                if texture_index.is_some() && !plan.warnings.contains(&missing) {
                    plan.warnings.push(missing);
                }
                fallback = texture::placeholder(color, placeholder_size);
                &fallback
            }
        };

        let images = pages[unit.page]
            .textures
            .get_mut(&property)
            .ok_or_else(|| BakeError::Texture(format!("no image allocated for {property}")))?;
        let (target, rect, bleed) = if array {
            let (w, h) = images[unit.placement].dimensions();
            let full = Placement {
                key: placement.key,
                x: 0,
                y: 0,
                width: w,
                height: h,
            };
            (&mut images[unit.placement], full, 0)
        } else {
            (&mut images[0], placement, padding)
        };

        match algorithm {
            PackingAlgorithm::Guillotine => texture::blit_sampled(target, source, &sampling, &rect),
            PackingAlgorithm::Fast => texture::blit_scaled(target, source, &sampling, &rect),
        }
        texture::fill_bleed(target, &rect, bleed);
        Ok(())
    }
}

impl Resumable for TextureBakeJob<'_> {
    type Output = Vec<ClusterAtlas>;

    fn step(&mut self, budget: Duration) -> StepStatus {
        let budget = FrameBudget::start(budget);
        loop {
            if matches!(self.phase, Phase::Done) {
                return StepStatus::Done;
            }
            if let Err(e) = schedule::check_canceled(&self.cancel).and_then(|_| self.advance()) {
                warn!(error = %e, cluster = self.cursor, "Texture bake stopped");
                self.error = Some(e);
                return StepStatus::Failed;
            }
            if budget.exhausted() {
                return StepStatus::Pending;
            }
        }
    }

    fn finish(self) -> Result<Vec<ClusterAtlas>> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if !matches!(self.phase, Phase::Done) {
            return Err(BakeError::Canceled);
        }
        Ok(self.finished)
    }
}

/// Bake one cluster synchronously.
pub fn bake_cluster(scene: &Scene, config: &BakeConfig, key: &ClusterKey, members: &[SurfaceId]) -> Result<ClusterAtlas> {
    let mut clusters = ClusterMap::new();
    clusters.insert(key.clone(), members.to_vec());
    let job = TextureBakeJob::new(scene, config, &clusters, CancelToken::new())?;
    schedule::run_blocking(job)?
        .pop()
        .ok_or_else(|| BakeError::Texture(format!("cluster {key} produced no atlas")))
}

fn material_label(material: &Material, id: MaterialId) -> String {
    if material.name.is_empty() {
        id.to_string()
    } else {
        material.name.clone()
    }
}

/// Tiling analysis, result-material grouping and packing for one cluster.
fn plan_cluster(scene: &Scene, config: &BakeConfig, key: &ClusterKey, members: &[SurfaceId]) -> Result<ClusterPlan> {
    let packing = &config.packing;
    let consider = config.tiling.consider_surface_uvs;

    // Material -> UV rects of every submesh drawing it
    let mut users: BTreeMap<MaterialId, Vec<Rect>> = BTreeMap::new();
    for (index, &id) in members.iter().enumerate() {
        let surface = scene
            .surface(id)
            .ok_or_else(|| BakeError::input(index, id.to_string(), "surface not found in scene"))?;
        let mesh = inspect::mesh(scene, surface)
            .ok_or_else(|| BakeError::input(index, surface.label(), "surface has no mesh"))?;
        for (slot, &material) in inspect::materials(surface).iter().enumerate() {
            if inspect::material(scene, material).is_none() {
                return Err(BakeError::MaterialMapping(format!(
                    "{material} used by {} is not in the material library",
                    surface.label()
                )));
            }
            let rect = uv_rect::mesh_uv_bounds(mesh, Some(slot)).unwrap_or(Rect::UNIT);
            users.entry(material).or_default().push(rect);
        }
    }

    let mut warnings = Vec::new();
    let mut properties: BTreeSet<String> = BTreeSet::new();
    for &id in users.keys() {
        if let Some(m) = scene.library.get(id) {
            properties.extend(m.textures.keys().cloned());
        }
    }
    if properties.is_empty() {
        properties.insert(DEFAULT_PROPERTY.to_string());
    }
    let properties: Vec<String> = properties.into_iter().collect();

    let mut materials = Vec::with_capacity(users.len());
    for (&id, rects) in &users {
        let Some(material) = scene.library.get(id) else {
            continue;
        };
        let info = uv_rect::analyze_material(material, rects.iter().copied(), consider);
        let (width, height) = source_size(scene, material, &properties, packing.placeholder_size);
        materials.push(MaterialEntry {
            id,
            info,
            width,
            height,
            demoted: false,
        });
    }

    let groups = result_groups(scene, config, key, &materials)?;
    let limits = PackLimits::from_config(packing);
    let array_mode = packing.result_type == ResultType::TextureArray;
    let mut pages = Vec::new();

    for (group_name, group) in &groups {
        if !array_mode {
            demote_incompatible(scene, &mut materials, group, &mut warnings);
        }
        for &i in group {
            let entry = &mut materials[i];
            if entry.info.treatment == TilingTreatment::Unknown {
                let cap = config.tiling.max_tiling_bake_size;
                entry.width = ((entry.width as f64 * entry.info.sampling.width).ceil() as u32).clamp(1, cap);
                entry.height = ((entry.height as f64 * entry.info.sampling.height).ceil() as u32).clamp(1, cap);
            }
        }

        if array_mode {
            pages.push(array_page(group_name.clone(), group, &materials, &limits));
            continue;
        }

        let items: Vec<PackItem> = group
            .iter()
            .map(|&i| PackItem {
                key: i,
                width: materials[i].width,
                height: materials[i].height,
            })
            .collect();
        let layout = Layout::for_treatment(materials[group[0]].info.treatment);
        let packed = packer::pack_pages(&items, layout, packing.algorithm, &limits, packing.multi_material)
            .ok_or_else(|| {
                BakeError::Texture(format!(
                    "cluster {key}: {} entries do not fit a {}x{} atlas even after downscaling",
                    items.len(),
                    limits.max_width,
                    limits.max_height
                ))
            })?;
        let split = packed.len() > 1;
        for (n, page) in packed.into_iter().enumerate() {
            let name = if split {
                format!("{group_name}-part{n}")
            } else {
                group_name.clone()
            };
            if page.downscale > 0 {
                warnings.push(Warning::Downscaled {
                    result_material: name.clone(),
                    factor: 1 << page.downscale,
                });
            }
            pages.push(PagePlan {
                result_material: name,
                width: page.width,
                height: page.height,
                placements: page.placements,
                array: false,
            });
        }
    }

    for entry in &materials {
        if entry.info.treatment == TilingTreatment::Unknown && !entry.demoted {
            warnings.push(Warning::OversampledTiling {
                material: label_of(scene, entry.id),
                property_count: properties.len(),
            });
        }
    }

    Ok(ClusterPlan {
        key: key.clone(),
        materials,
        properties,
        pages,
        warnings,
    })
}

fn label_of(scene: &Scene, id: MaterialId) -> String {
    scene
        .library
        .get(id)
        .map(|m| material_label(m, id))
        .unwrap_or_else(|| id.to_string())
}

/// Largest source image over the cluster's properties; placeholders count as
/// `placeholder_size`.
fn source_size(scene: &Scene, material: &Material, properties: &[String], placeholder_size: u32) -> (u32, u32) {
    let mut size = (0u32, 0u32);
    for property in properties {
        let tex = material
            .textures
            .get(property)
            .and_then(|slot| slot.texture)
            .and_then(|i| scene.library.texture(i))
            .filter(|t| t.width > 0 && t.height > 0);
        let (w, h) = tex.map_or((placeholder_size, placeholder_size), |t| (t.width, t.height));
        size = (size.0.max(w), size.1.max(h));
    }
    (size.0.max(1), size.1.max(1))
}

/// Split the cluster's materials into named result-material groups.
///
/// Values index `materials`. Custom assignments take precedence; otherwise
/// multi-material output separates incompatible tiling treatments.
fn result_groups(
    scene: &Scene,
    config: &BakeConfig,
    key: &ClusterKey,
    materials: &[MaterialEntry],
) -> Result<Vec<(String, Vec<usize>)>> {
    let packing = &config.packing;
    let index_of: BTreeMap<MaterialId, usize> = materials.iter().enumerate().map(|(i, e)| (e.id, i)).collect();

    if !packing.custom_result_materials.is_empty() {
        let mut groups = Vec::new();
        let mut assigned = BTreeSet::new();
        for custom in &packing.custom_result_materials {
            for source in &custom.sources {
                if scene.library.get(*source).is_none() {
                    return Err(BakeError::MaterialMapping(format!(
                        "result material '{}' lists {source}, which is not in the material library",
                        custom.name
                    )));
                }
            }
            let members: Vec<usize> = custom.sources.iter().filter_map(|s| index_of.get(s).copied()).collect();
            assigned.extend(members.iter().copied());
            if !members.is_empty() {
                groups.push((custom.name.clone(), members));
            }
        }
        if let Some(missing) = (0..materials.len()).find(|i| !assigned.contains(i)) {
            return Err(BakeError::MaterialMapping(format!(
                "{} in cluster {key} is not assigned to any custom result material",
                materials[missing].id
            )));
        }
        return Ok(groups);
    }

    if !packing.multi_material || packing.result_type == ResultType::TextureArray {
        return Ok(vec![(key.to_string(), (0..materials.len()).collect())]);
    }

    let mut by_group: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
    let mut whole_pages = Vec::new();
    for (i, entry) in materials.iter().enumerate() {
        match entry.info.treatment {
            TilingTreatment::EdgeToEdgeXY => whole_pages.push(vec![i]),
            t => by_group.entry(t.pack_group()).or_default().push(i),
        }
    }
    let mut parts: Vec<Vec<usize>> = by_group.into_values().collect();
    parts.extend(whole_pages);
    if parts.len() == 1 {
        return Ok(vec![(key.to_string(), parts.remove(0))]);
    }
    Ok(parts
        .into_iter()
        .enumerate()
        .map(|(n, members)| (format!("{key}-mat{n}"), members))
        .collect())
}

/// Fall back to oversampling when a group's treatments cannot share a page.
fn demote_incompatible(scene: &Scene, materials: &mut [MaterialEntry], group: &[usize], warnings: &mut Vec<Warning>) {
    let first = materials[group[0]].info.treatment;
    let mixed = group.iter().any(|&i| !materials[i].info.treatment.compatible_with(first));
    let crowded_whole_page = first == TilingTreatment::EdgeToEdgeXY && group.len() > 1;
    if !mixed && !crowded_whole_page {
        return;
    }
    for &i in group {
        let entry = &mut materials[i];
        let from = entry.info.treatment;
        if matches!(from, TilingTreatment::None | TilingTreatment::Unknown) {
            continue;
        }
        entry.info.treatment = TilingTreatment::Unknown;
        entry.info.sampling = entry.info.encapsulating;
        entry.demoted = true;
        warnings.push(Warning::DemotedTiling {
            material: label_of(scene, entry.id),
            from: from.to_string(),
        });
    }
}

/// Every member gets one equally sized slice.
fn array_page(name: String, group: &[usize], materials: &[MaterialEntry], limits: &PackLimits) -> PagePlan {
    let width = limits.snap(group.iter().map(|&i| materials[i].width).max().unwrap_or(1), limits.max_width);
    let height = limits.snap(group.iter().map(|&i| materials[i].height).max().unwrap_or(1), limits.max_height);
    PagePlan {
        result_material: name,
        width,
        height,
        placements: group
            .iter()
            .map(|&key| Placement {
                key,
                x: 0,
                y: 0,
                width,
                height,
            })
            .collect(),
        array: true,
    }
}

fn allocate_pages(plan: &ClusterPlan) -> Vec<AtlasPage> {
    plan.pages
        .iter()
        .map(|p| {
            let (mut page, layers) = if p.array {
                (AtlasPage::texture_array(p.result_material.clone(), p.width, p.height), p.placements.len())
            } else {
                (AtlasPage::new(p.result_material.clone(), p.width, p.height), 1)
            };
            for property in &plan.properties {
                page.textures
                    .insert(property.clone(), vec![RgbaImage::new(p.width, p.height); layers]);
            }
            page
        })
        .collect()
}

fn raster_units(plan: &ClusterPlan) -> Vec<RasterUnit> {
    let mut units = Vec::new();
    for (page, p) in plan.pages.iter().enumerate() {
        for property in 0..plan.properties.len() {
            for placement in 0..p.placements.len() {
                units.push(RasterUnit {
                    page,
                    property,
                    placement,
                });
            }
        }
    }
    units
}

/// Build the result tables. Nothing is committed unless every record is valid.
fn emit(plan: ClusterPlan, pages: Vec<AtlasPage>, config: &BakeConfig) -> Result<ClusterAtlas> {
    let consider = config.tiling.consider_surface_uvs;
    let mut result = BakeResult::new(config.packing.result_type);

    for page in &plan.pages {
        let mut sources = Vec::with_capacity(page.placements.len());
        for (slice, placement) in page.placements.iter().enumerate() {
            let entry = &plan.materials[placement.key];
            let (dest, slice_index) = if page.array {
                (Rect::UNIT, slice as i32)
            } else {
                (placement.normalized(page.width, page.height), -1)
            };
            result.add_rect(AtlasRectRecord::new(
                entry.id,
                dest,
                entry.info.treatment,
                entry.info.sampling,
                entry.info.material_tiling,
                slice_index,
                consider,
            )?)?;
            sources.push(entry.id);
        }
        if !page.array {
            sources.sort();
        }
        if page.array {
            result.add_texture_array(TextureArraySliceTable {
                result_material: page.result_material.clone(),
                slice_width: page.width,
                slice_height: page.height,
                properties: plan.properties.clone(),
                slices: sources.clone(),
            });
        }
        result.add_result_material(ResultMaterialMapping {
            name: page.result_material.clone(),
            source_materials: sources,
            consider_surface_uvs: consider,
        })?;
    }
    result.validate()?;

    Ok(ClusterAtlas {
        cluster: plan.key,
        result,
        pages,
        warnings: plan.warnings,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::config::CustomResultMaterial;

    fn scene_with(n: usize, size: u32) -> (Scene, Vec<SurfaceId>) {
        let mut scene = Scene::default();
        let mut ids = Vec::new();
        for i in 0..n {
            let m = add_material(&mut scene, &format!("m{i}"), size, [i as u8 * 40, 0, 0, 255]);
            ids.push(add_surface(&mut scene, i as u64, quad([0.0, 0.0], [1.0, 1.0]), m));
        }
        (scene, ids)
    }

    fn assert_rects_valid(atlas: &ClusterAtlas) {
        for page in &atlas.result.result_materials {
            let rects: Vec<&AtlasRectRecord> = page
                .source_materials
                .iter()
                .map(|&m| atlas.result.rect_for(m).unwrap())
                .collect();
            for (i, a) in rects.iter().enumerate() {
                assert!(Rect::UNIT.contains_rect(&a.dest_rect));
                for b in &rects[i + 1..] {
                    if !a.is_slice() {
                        assert!(!a.dest_rect.overlaps(&b.dest_rect));
                    }
                }
            }
        }
    }

    #[test]
    fn packs_materials_into_one_atlas() {
        let (scene, ids) = scene_with(4, 32);
        let config = BakeConfig::default();
        let atlas = bake_cluster(&scene, &config, &ClusterKey::from("c"), &ids).unwrap();

        assert_eq!(atlas.result.atlas_rects.len(), 4);
        assert_eq!(atlas.result.result_materials.len(), 1);
        assert_eq!(atlas.result.result_materials[0].name, "c");
        assert_eq!(atlas.pages.len(), 1);
        assert!(atlas.pages[0].textures.contains_key("_MainTex"));
        assert_rects_valid(&atlas);

        // Pixels of material 1 land inside its rect
        let r = atlas.result.rect_for(MaterialId(1)).unwrap().dest_rect;
        let img = &atlas.pages[0].textures["_MainTex"][0];
        let px = ((r.x + r.width / 2.0) * img.width() as f64) as u32;
        let py = ((r.y + r.height / 2.0) * img.height() as f64) as u32;
        assert_eq!(img.get_pixel(px, py).0, [40, 0, 0, 255]);
    }

    #[test]
    fn shared_material_packed_once() {
        let mut scene = Scene::default();
        let m = add_material(&mut scene, "shared", 16, [1, 2, 3, 255]);
        let a = add_surface(&mut scene, 1, quad([0.0, 0.0], [1.0, 1.0]), m);
        let b = add_surface(&mut scene, 2, quad([0.0, 0.0], [0.5, 0.5]), m);
        let atlas = bake_cluster(&scene, &BakeConfig::default(), &"c".into(), &[a, b]).unwrap();
        assert_eq!(atlas.result.atlas_rects.len(), 1);
    }

    #[test]
    fn missing_texture_uses_placeholder() {
        let mut scene = Scene::default();
        scene.library.materials.push(Material {
            name: "flat".into(),
            colors: [("_Color".to_string(), [0.0, 1.0, 0.0, 1.0])].into_iter().collect(),
            ..Default::default()
        });
        let id = add_surface(&mut scene, 1, quad([0.0, 0.0], [1.0, 1.0]), MaterialId(0));
        let atlas = bake_cluster(&scene, &BakeConfig::default(), &"c".into(), &[id]).unwrap();
        let img = &atlas.pages[0].textures[DEFAULT_PROPERTY][0];
        let r = atlas.result.atlas_rects[0].dest_rect;
        let px = ((r.x + r.width / 2.0) * img.width() as f64) as u32;
        let py = ((r.y + r.height / 2.0) * img.height() as f64) as u32;
        assert_eq!(img.get_pixel(px, py).0, [0, 255, 0, 255]);
    }

    #[test]
    fn empty_texture_falls_back_to_placeholder() {
        let mut scene = Scene::default();
        let good = add_material(&mut scene, "good", 16, [9, 9, 9, 255]);
        let empty = add_material(&mut scene, "empty", 0, [0, 0, 0, 0]);
        assert_eq!(scene.library.textures[1].width, 0);
        assert!(scene.library.textures[1].data.is_empty());
        let a = add_surface(&mut scene, 1, quad([0.0, 0.0], [1.0, 1.0]), good);
        let b = add_surface(&mut scene, 2, quad([0.0, 0.0], [1.0, 1.0]), empty);

        let atlas = bake_cluster(&scene, &BakeConfig::default(), &"c".into(), &[a, b]).unwrap();
        assert_eq!(atlas.result.atlas_rects.len(), 2);
        assert_rects_valid(&atlas);
        assert!(atlas.warnings.iter().any(|w| matches!(
            w,
            Warning::MissingTexture { material, .. } if material.contains("empty")
        )));
    }

    #[test]
    fn edge_to_edge_x_spans_full_width() {
        let mut scene = Scene::default();
        let m = add_material(&mut scene, "stripes", 32, [5, 5, 5, 255]);
        let id = add_surface(&mut scene, 1, quad([-0.5, 0.0], [1.5, 1.0]), m);
        let atlas = bake_cluster(&scene, &BakeConfig::default(), &"c".into(), &[id]).unwrap();
        let r = &atlas.result.atlas_rects[0];
        assert_eq!(r.tiling_treatment, TilingTreatment::EdgeToEdgeX);
        assert_eq!(r.dest_rect.x, 0.0);
        assert_eq!(r.dest_rect.width, 1.0);
        assert_eq!(r.sampling_rect, Rect::UNIT);
    }

    #[test]
    fn incompatible_tiling_split_with_multi_material() {
        let mut scene = Scene::default();
        let plain = add_material(&mut scene, "plain", 16, [1, 0, 0, 255]);
        let stripes = add_material(&mut scene, "stripes", 16, [2, 0, 0, 255]);
        let a = add_surface(&mut scene, 1, quad([0.0, 0.0], [1.0, 1.0]), plain);
        let b = add_surface(&mut scene, 2, quad([0.0, 0.0], [3.0, 1.0]), stripes);

        let mut config = BakeConfig::default();
        config.packing.multi_material = true;
        let atlas = bake_cluster(&scene, &config, &"c".into(), &[a, b]).unwrap();
        assert_eq!(atlas.result.result_materials.len(), 2);
        assert_eq!(atlas.result.result_materials[0].name, "c-mat0");
        assert_eq!(
            atlas.result.rect_for(stripes).unwrap().tiling_treatment,
            TilingTreatment::EdgeToEdgeX
        );

        // Without multi-material the wrapping entry is oversampled instead
        config.packing.multi_material = false;
        let atlas = bake_cluster(&scene, &config, &"c".into(), &[a, b]).unwrap();
        assert_eq!(atlas.result.result_materials.len(), 1);
        let r = atlas.result.rect_for(stripes).unwrap();
        assert_eq!(r.tiling_treatment, TilingTreatment::Unknown);
        assert!(r.sampling_rect.approx_eq(&Rect::new(0.0, 0.0, 3.0, 1.0)));
        assert!(atlas.warnings.iter().any(|w| matches!(w, Warning::DemotedTiling { .. })));
        assert_rects_valid(&atlas);
    }

    #[test]
    fn oversized_group_split_into_parts() {
        let (scene, ids) = scene_with(3, 600);
        let mut config = BakeConfig::default();
        config.packing.max_atlas_size = 1024;
        config.packing.padding = 0;
        config.packing.multi_material = true;
        let atlas = bake_cluster(&scene, &config, &"big".into(), &ids).unwrap();
        assert!(atlas.result.result_materials.len() >= 2);
        assert!(atlas.result.result_materials[0].name.starts_with("big-part"));
        assert!(atlas.result.validate().is_ok());
        assert_rects_valid(&atlas);

        config.packing.multi_material = false;
        let atlas = bake_cluster(&scene, &config, &"big".into(), &ids).unwrap();
        assert_eq!(atlas.result.result_materials.len(), 1);
        assert!(atlas.warnings.iter().any(|w| matches!(w, Warning::Downscaled { .. })));
    }

    #[test]
    fn texture_array_slices() {
        let (scene, ids) = scene_with(3, 16);
        let mut config = BakeConfig::default();
        config.packing.result_type = ResultType::TextureArray;
        let atlas = bake_cluster(&scene, &config, &"arr".into(), &ids).unwrap();
        let table = atlas.result.texture_array_for("arr").unwrap();
        assert_eq!(table.slices.len(), 3);
        assert_eq!(atlas.pages[0].textures["_MainTex"].len(), 3);
        for (i, &m) in table.slices.iter().enumerate() {
            let r = atlas.result.rect_for(m).unwrap();
            assert_eq!(r.texture_array_slice_index, i as i32);
            assert_eq!(r.dest_rect, Rect::UNIT);
        }
        assert_eq!(atlas.pages[0].textures["_MainTex"][2].get_pixel(3, 3).0, [80, 0, 0, 255]);
        assert!(atlas.pages[0].array);
    }

    #[test]
    fn single_member_texture_array_is_still_an_array() {
        let (scene, ids) = scene_with(1, 16);
        let mut config = BakeConfig::default();
        config.packing.result_type = ResultType::TextureArray;
        let atlas = bake_cluster(&scene, &config, &"arr".into(), &ids).unwrap();
        assert!(atlas.pages[0].array);

        let dir = tempfile::tempdir().unwrap();
        let written = atlas.pages[0].write(dir.path(), crate::config::AtlasFormat::Png).unwrap();
        assert_eq!(written, vec![dir.path().join("arr_MainTex_slice0.png")]);
    }

    #[test]
    fn custom_result_materials() {
        let (scene, ids) = scene_with(3, 16);
        let mut config = BakeConfig::default();
        config.packing.custom_result_materials = vec![
            CustomResultMaterial {
                name: "first".into(),
                sources: vec![MaterialId(0)],
            },
            CustomResultMaterial {
                name: "rest".into(),
                sources: vec![MaterialId(1), MaterialId(2)],
            },
        ];
        let atlas = bake_cluster(&scene, &config, &"c".into(), &ids).unwrap();
        assert_eq!(atlas.result.sources_of("rest").unwrap(), &[MaterialId(1), MaterialId(2)]);

        config.packing.custom_result_materials.pop();
        let err = bake_cluster(&scene, &config, &"c".into(), &ids).unwrap_err();
        assert!(matches!(err, BakeError::MaterialMapping(_)));
    }

    #[test]
    fn unknown_material_is_mapping_error() {
        let mut scene = Scene::default();
        let id = add_surface(&mut scene, 1, quad([0.0, 0.0], [1.0, 1.0]), MaterialId(42));
        let err = bake_cluster(&scene, &BakeConfig::default(), &"c".into(), &[id]).unwrap_err();
        assert!(matches!(err, BakeError::MaterialMapping(_)));
    }

    #[test]
    fn time_sliced_matches_blocking() {
        let (scene, ids) = scene_with(5, 16);
        let config = BakeConfig::default();
        let mut clusters = ClusterMap::new();
        clusters.insert("a".into(), ids[..2].to_vec());
        clusters.insert("b".into(), ids[2..].to_vec());

        let blocking = schedule::run_blocking(
            TextureBakeJob::new(&scene, &config, &clusters, CancelToken::new()).unwrap(),
        )
        .unwrap();
        let job = TextureBakeJob::new(&scene, &config, &clusters, CancelToken::new()).unwrap();
        let (sliced, frames) = schedule::run_sliced(job, Duration::ZERO).unwrap();

        assert!(frames > 2);
        assert_eq!(sliced.len(), 2);
        for (a, b) in blocking.iter().zip(&sliced) {
            assert_eq!(a.cluster, b.cluster);
            assert_eq!(a.result, b.result);
            assert_eq!(a.pages[0].textures["_MainTex"][0], b.pages[0].textures["_MainTex"][0]);
        }
    }

    #[test]
    fn cancel_leaves_no_result() {
        let (scene, ids) = scene_with(3, 16);
        let config = BakeConfig::default();
        let mut clusters = ClusterMap::new();
        clusters.insert("a".into(), ids);
        let cancel = CancelToken::new();
        let mut job = TextureBakeJob::new(&scene, &config, &clusters, cancel.clone()).unwrap();
        assert_eq!(job.step(Duration::ZERO), StepStatus::Pending);
        cancel.cancel();
        assert_eq!(job.step(Duration::ZERO), StepStatus::Failed);
        assert_eq!(job.progress().0, 0);
        assert!(matches!(job.finish(), Err(BakeError::Canceled)));
    }

    #[test]
    fn invalid_config_rejected_up_front() {
        let (scene, _) = scene_with(1, 16);
        let mut config = BakeConfig::default();
        config.packing.max_atlas_size = 0;
        let result = TextureBakeJob::new(&scene, &config, &ClusterMap::new(), CancelToken::new());
        assert!(matches!(result, Err(BakeError::Configuration { .. })));
    }
}
