use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::rect::Rect;

/// Raw texture image data.
#[derive(Debug, Clone)]
pub struct TextureData {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
}

/// Index of a material inside a [`MaterialLibrary`].
///
/// Two surfaces referencing the same id share the material and are packed once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaterialId(pub usize);

impl std::fmt::Display for MaterialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "material#{}", self.0)
    }
}

fn unit_scale() -> [f64; 2] {
    [1.0, 1.0]
}

/// A named texture property of a material and its tiling transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextureSlot {
    /// Index into `MaterialLibrary::textures`; `None` means the property is unset.
    #[serde(default)]
    pub texture: Option<usize>,
    #[serde(default = "unit_scale")]
    pub scale: [f64; 2],
    #[serde(default)]
    pub offset: [f64; 2],
}

impl Default for TextureSlot {
    fn default() -> Self {
        Self {
            texture: None,
            scale: unit_scale(),
            offset: [0.0, 0.0],
        }
    }
}

/// A shader plus named texture, color and scalar properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Material {
    pub name: String,
    #[serde(default)]
    pub shader: String,
    #[serde(default)]
    pub textures: BTreeMap<String, TextureSlot>,
    #[serde(default)]
    pub colors: BTreeMap<String, [f32; 4]>,
    #[serde(default)]
    pub scalars: BTreeMap<String, f32>,
}

/// Color property consulted when a texture slot has no image.
pub const BASE_COLOR_PROPERTY: &str = "_Color";

impl Default for Material {
    fn default() -> Self {
        Self {
            name: String::new(),
            shader: "Standard".into(),
            textures: BTreeMap::new(),
            colors: BTreeMap::new(),
            scalars: BTreeMap::new(),
        }
    }
}

impl Material {
    /// Tiling rect shared by every texture property of this material.
    ///
    /// Taken from the first texture slot (sorted by name); the unit rect when
    /// the material has no textures.
    pub fn tiling_rect(&self) -> Rect {
        self.textures
            .values()
            .next()
            .map(|slot| Rect::new(slot.offset[0], slot.offset[1], slot.scale[0], slot.scale[1]))
            .unwrap_or(Rect::UNIT)
    }

    /// Whether every texture slot uses the same tiling transform.
    pub fn shares_tiling(&self) -> bool {
        let mut slots = self.textures.values();
        let Some(first) = slots.next() else {
            return true;
        };
        slots.all(|s| s.scale == first.scale && s.offset == first.offset)
    }

    pub fn base_color(&self) -> [f32; 4] {
        self.colors
            .get(BASE_COLOR_PROPERTY)
            .copied()
            .unwrap_or([1.0, 1.0, 1.0, 1.0])
    }
}

/// Collection of materials and their associated textures.
#[derive(Debug, Clone, Default)]
pub struct MaterialLibrary {
    pub materials: Vec<Material>,
    pub textures: Vec<TextureData>,
}

impl MaterialLibrary {
    pub fn get(&self, id: MaterialId) -> Option<&Material> {
        self.materials.get(id.0)
    }

    pub fn texture(&self, index: usize) -> Option<&TextureData> {
        self.textures.get(index)
    }
}
