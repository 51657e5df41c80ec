//! Bake results: the material → atlas-rect table, result-material mappings,
//! texture-array slice tables and the atlas images themselves.
//!
//! The tables are persisted as versioned JSON. Loading an older version
//! fills fields that did not exist yet with the values that version implied;
//! a field missing from a file that should have it is an error.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atlas::texture;
use crate::atlas::uv_rect::TilingTreatment;
use crate::config::{AtlasFormat, ResultType};
use crate::error::{BakeError, Result};
use crate::types::{MaterialId, Rect};

/// Format version written by this build.
///
/// - 1: source material, dest rect, tiling treatment
/// - 2: adds `consider_surface_uvs`
/// - 3: adds sampling and material tiling rects, texture-array slice index
pub const CURRENT_VERSION: u32 = 3;

/// Where one source material landed in the bake output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AtlasRectRecord {
    pub source_material: MaterialId,
    /// Placement in normalized page coordinates; the unit rect for texture arrays.
    pub dest_rect: Rect,
    pub tiling_treatment: TilingTreatment,
    /// Region of tiled source-texture space captured into `dest_rect`.
    pub sampling_rect: Rect,
    /// The material's own scale/offset at bake time.
    pub material_tiling_rect: Rect,
    /// Slice index in texture-array mode, -1 for atlases.
    pub texture_array_slice_index: i32,
    pub consider_surface_uvs: bool,
}

impl AtlasRectRecord {
    pub fn new(
        source_material: MaterialId,
        dest_rect: Rect,
        tiling_treatment: TilingTreatment,
        sampling_rect: Rect,
        material_tiling_rect: Rect,
        texture_array_slice_index: i32,
        consider_surface_uvs: bool,
    ) -> Result<Self> {
        if !Rect::UNIT.contains_rect(&dest_rect) {
            return Err(BakeError::MaterialMapping(format!(
                "{source_material}: destination rect {dest_rect:?} leaves the atlas"
            )));
        }
        if tiling_treatment == TilingTreatment::None && !sampling_rect.approx_eq(&Rect::UNIT) {
            return Err(BakeError::MaterialMapping(format!(
                "{source_material}: untiled entry must sample the unit rect, got {sampling_rect:?}"
            )));
        }
        if !(sampling_rect.width > 0.0 && sampling_rect.height > 0.0) {
            return Err(BakeError::MaterialMapping(format!(
                "{source_material}: empty sampling rect {sampling_rect:?}"
            )));
        }
        Ok(Self {
            source_material,
            dest_rect,
            tiling_treatment,
            sampling_rect,
            material_tiling_rect,
            texture_array_slice_index,
            consider_surface_uvs,
        })
    }

    /// The atlas rect for a texture-array slice.
    pub fn is_slice(&self) -> bool {
        self.texture_array_slice_index >= 0
    }
}

/// One emitted combined material and the sources it replaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultMaterialMapping {
    pub name: String,
    pub source_materials: Vec<MaterialId>,
    pub consider_surface_uvs: bool,
}

/// Per result material: which source material fills each array slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextureArraySliceTable {
    pub result_material: String,
    pub slice_width: u32,
    pub slice_height: u32,
    /// Texture properties; each has one array with `slices.len()` layers.
    pub properties: Vec<String>,
    /// Source material per slice index.
    pub slices: Vec<MaterialId>,
}

/// Output tables of one cluster's texture bake.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BakeResult {
    pub version: u32,
    pub result_type: ResultType,
    pub atlas_rects: Vec<AtlasRectRecord>,
    pub result_materials: Vec<ResultMaterialMapping>,
    pub texture_arrays: Vec<TextureArraySliceTable>,
}

impl BakeResult {
    pub fn new(result_type: ResultType) -> Self {
        Self {
            version: CURRENT_VERSION,
            result_type,
            atlas_rects: Vec::new(),
            result_materials: Vec::new(),
            texture_arrays: Vec::new(),
        }
    }

    pub fn add_rect(&mut self, record: AtlasRectRecord) -> Result<()> {
        if self.rect_for(record.source_material).is_some() {
            return Err(BakeError::MaterialMapping(format!(
                "{} already has an atlas rect",
                record.source_material
            )));
        }
        self.atlas_rects.push(record);
        Ok(())
    }

    /// Register a result material. Names are unique and source lists disjoint.
    pub fn add_result_material(&mut self, mapping: ResultMaterialMapping) -> Result<()> {
        if self.result_materials.iter().any(|m| m.name == mapping.name) {
            return Err(BakeError::MaterialMapping(format!(
                "duplicate result material '{}'",
                mapping.name
            )));
        }
        for &source in &mapping.source_materials {
            if let Some((_, owner)) = self.result_material_for(source) {
                return Err(BakeError::MaterialMapping(format!(
                    "{source} already maps to '{}', cannot also map to '{}'",
                    owner.name, mapping.name
                )));
            }
        }
        self.result_materials.push(mapping);
        Ok(())
    }

    pub fn add_texture_array(&mut self, table: TextureArraySliceTable) {
        self.texture_arrays.push(table);
    }

    pub fn rect_for(&self, material: MaterialId) -> Option<&AtlasRectRecord> {
        self.atlas_rects.iter().find(|r| r.source_material == material)
    }

    /// Result material that replaces `material`, with its submesh index.
    pub fn result_material_for(&self, material: MaterialId) -> Option<(usize, &ResultMaterialMapping)> {
        self.result_materials
            .iter()
            .enumerate()
            .find(|(_, m)| m.source_materials.contains(&material))
    }

    pub fn sources_of(&self, result_material: &str) -> Option<&[MaterialId]> {
        self.result_materials
            .iter()
            .find(|m| m.name == result_material)
            .map(|m| m.source_materials.as_slice())
    }

    pub fn texture_array_for(&self, result_material: &str) -> Option<&TextureArraySliceTable> {
        self.texture_arrays
            .iter()
            .find(|t| t.result_material == result_material)
    }

    /// Every mapped source has exactly one rect, and vice versa.
    pub fn validate(&self) -> Result<()> {
        let mapped: BTreeSet<MaterialId> = self
            .result_materials
            .iter()
            .flat_map(|m| m.source_materials.iter().copied())
            .collect();
        let rects: BTreeSet<MaterialId> = self.atlas_rects.iter().map(|r| r.source_material).collect();
        if let Some(missing) = mapped.difference(&rects).next() {
            return Err(BakeError::MaterialMapping(format!("{missing} has no atlas rect")));
        }
        if let Some(orphan) = rects.difference(&mapped).next() {
            return Err(BakeError::MaterialMapping(format!(
                "{orphan} has an atlas rect but no result material"
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse any supported version, upgrading it to the current layout.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawBakeResult = serde_json::from_str(text)?;
        raw.upgrade()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

#[derive(Deserialize)]
struct RawRecord {
    source_material: MaterialId,
    dest_rect: Rect,
    tiling_treatment: TilingTreatment,
    consider_surface_uvs: Option<bool>,
    sampling_rect: Option<Rect>,
    material_tiling_rect: Option<Rect>,
    texture_array_slice_index: Option<i32>,
}

#[derive(Deserialize)]
struct RawMapping {
    name: String,
    source_materials: Vec<MaterialId>,
    consider_surface_uvs: Option<bool>,
}

#[derive(Deserialize)]
struct RawBakeResult {
    version: u32,
    #[serde(default)]
    result_type: ResultType,
    #[serde(default)]
    atlas_rects: Vec<RawRecord>,
    #[serde(default)]
    result_materials: Vec<RawMapping>,
    #[serde(default)]
    texture_arrays: Vec<TextureArraySliceTable>,
}

/// Value of a field introduced in `since`: the implied default for older
/// files, required for newer ones.
fn gated<T>(value: Option<T>, version: u32, since: u32, implied: T, field: &str) -> Result<T> {
    match value {
        Some(v) => Ok(v),
        None if version < since => Ok(implied),
        None => Err(BakeError::Persistence(format!(
            "field '{field}' missing from version {version} bake result"
        ))),
    }
}

impl RawBakeResult {
    fn upgrade(self) -> Result<BakeResult> {
        let version = self.version;
        if version == 0 || version > CURRENT_VERSION {
            return Err(BakeError::Persistence(format!(
                "unsupported bake result version {version} (this build reads 1..={CURRENT_VERSION})"
            )));
        }

        let mut result = BakeResult::new(self.result_type);
        for r in self.atlas_rects {
            let record = AtlasRectRecord::new(
                r.source_material,
                r.dest_rect,
                r.tiling_treatment,
                gated(r.sampling_rect, version, 3, Rect::UNIT, "sampling_rect")?,
                gated(r.material_tiling_rect, version, 3, Rect::UNIT, "material_tiling_rect")?,
                gated(r.texture_array_slice_index, version, 3, -1, "texture_array_slice_index")?,
                gated(r.consider_surface_uvs, version, 2, true, "consider_surface_uvs")?,
            )?;
            result.add_rect(record)?;
        }
        for m in self.result_materials {
            result.add_result_material(ResultMaterialMapping {
                name: m.name,
                source_materials: m.source_materials,
                consider_surface_uvs: gated(m.consider_surface_uvs, version, 2, true, "consider_surface_uvs")?,
            })?;
        }
        result.texture_arrays = self.texture_arrays;
        if version < CURRENT_VERSION {
            debug!(from = version, to = CURRENT_VERSION, "Upgraded bake result");
        }
        Ok(result)
    }
}

/// Images for one result material.
///
/// In atlas mode every property has one image; in texture-array mode every
/// property has one image per slice.
#[derive(Debug, Clone)]
pub struct AtlasPage {
    pub result_material: String,
    pub width: u32,
    pub height: u32,
    /// Texture array; every image is one slice.
    pub array: bool,
    pub textures: BTreeMap<String, Vec<RgbaImage>>,
}

impl AtlasPage {
    pub fn new(result_material: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            result_material: result_material.into(),
            width,
            height,
            array: false,
            textures: BTreeMap::new(),
        }
    }

    pub fn texture_array(result_material: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            array: true,
            ..Self::new(result_material, width, height)
        }
    }

    /// Encode every image into `dir`, returning the written paths.
    ///
    /// Atlas images are named `<material>_<property>.<ext>`; array slices,
    /// even a lone one, are named `<material>_<property>_slice<i>.<ext>`.
    pub fn write(&self, dir: &Path, format: AtlasFormat) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for (property, images) in &self.textures {
            let property = property.trim_start_matches('_');
            for (i, image) in images.iter().enumerate() {
                let name = if self.array {
                    format!("{}_{property}_slice{i}.{}", self.result_material, texture::extension(format))
                } else {
                    format!("{}_{property}.{}", self.result_material, texture::extension(format))
                };
                let encoded = texture::encode(image, format)?;
                let path = dir.join(name);
                std::fs::write(&path, &encoded.data)?;
                written.push(path);
            }
        }
        Ok(written)
    }
}
