//! JSON scene descriptions for the command-line pipeline.
//!
//! A scene file lists textures, materials, meshes, bones and surfaces.
//! Textures are either image files (relative to the scene file) or solid
//! colors; everything else deserializes straight into the data model.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use image::{Rgba, RgbaImage};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{BakeError, Result};
use crate::inspect;
use crate::types::{Bone, Material, MaterialLibrary, MeshData, Scene, Surface, TextureData};

fn default_solid_size() -> u32 {
    4
}

/// Where a texture's pixels come from.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TextureSource {
    File {
        path: PathBuf,
    },
    Solid {
        color: [u8; 4],
        #[serde(default = "default_solid_size")]
        size: u32,
    },
}

/// On-disk layout of a scene description.
#[derive(Debug, Clone, Deserialize)]
pub struct SceneFile {
    #[serde(default)]
    pub textures: Vec<TextureSource>,
    #[serde(default)]
    pub materials: Vec<Material>,
    #[serde(default)]
    pub meshes: Vec<MeshData>,
    #[serde(default)]
    pub bones: Vec<Bone>,
    pub surfaces: Vec<Surface>,
}

/// Summary statistics of a loaded scene.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneStats {
    pub surfaces: usize,
    pub meshes: usize,
    pub total_vertices: usize,
    pub total_triangles: usize,
    pub materials: usize,
    pub textures: usize,
    pub skinned_surfaces: usize,
}

/// Load and resolve a scene file, refreshing every surface's world bounds.
pub fn load_scene(path: &Path) -> Result<Scene> {
    if !path.exists() {
        return Err(BakeError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("scene file not found: {}", path.display()),
        )));
    }
    let text = std::fs::read_to_string(path)?;
    let file: SceneFile = serde_json::from_str(&text)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let scene = resolve(file, base)?;

    let stats = compute_stats(&scene);
    info!(
        path = %path.display(),
        surfaces = stats.surfaces,
        vertices = stats.total_vertices,
        materials = stats.materials,
        "Scene loaded"
    );
    Ok(scene)
}

/// Turn a parsed scene file into a [`Scene`], reading textures relative to `base`.
pub fn resolve(file: SceneFile, base: &Path) -> Result<Scene> {
    let mut seen = HashSet::new();
    for (index, surface) in file.surfaces.iter().enumerate() {
        if !seen.insert(surface.id) {
            return Err(BakeError::input(index, surface.label(), "duplicate surface id"));
        }
    }

    let textures = file
        .textures
        .iter()
        .map(|source| load_texture(source, base))
        .collect::<Result<Vec<_>>>()?;

    let mut scene = Scene {
        surfaces: file.surfaces,
        meshes: file.meshes,
        library: MaterialLibrary {
            materials: file.materials,
            textures,
        },
        bones: file.bones,
    };
    inspect::refresh_world_bounds(&mut scene);
    Ok(scene)
}

fn load_texture(source: &TextureSource, base: &Path) -> Result<TextureData> {
    match source {
        TextureSource::File { path } => {
            let full = base.join(path);
            let (width, height) = image::image_dimensions(&full)
                .map_err(|e| BakeError::Texture(format!("{}: {e}", full.display())))?;
            let mime_type = match full.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase) {
                Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
                Some(ext) if ext == "webp" => "image/webp",
                _ => "image/png",
            };
            debug!(path = %full.display(), width, height, "Texture read");
            Ok(TextureData {
                data: std::fs::read(&full)?,
                mime_type: mime_type.into(),
                width,
                height,
            })
        }
        TextureSource::Solid { color, size } => {
            let size = (*size).max(1);
            Ok(TextureData {
                data: RgbaImage::from_pixel(size, size, Rgba(*color)).into_raw(),
                mime_type: "image/raw".into(),
                width: size,
                height: size,
            })
        }
    }
}

pub fn compute_stats(scene: &Scene) -> SceneStats {
    SceneStats {
        surfaces: scene.surfaces.len(),
        meshes: scene.meshes.len(),
        total_vertices: scene.meshes.iter().map(MeshData::vertex_count).sum(),
        total_triangles: scene.meshes.iter().map(MeshData::triangle_count).sum(),
        materials: scene.library.materials.len(),
        textures: scene.library.textures.len(),
        skinned_surfaces: scene
            .surfaces
            .iter()
            .filter(|s| inspect::is_skinned(scene, s))
            .count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SurfaceId;

    const SCENE: &str = r#"{
        "textures": [
            {"color": [255, 0, 0, 255], "size": 8},
            {"path": "wood.png"}
        ],
        "materials": [
            {"name": "red", "textures": {"_MainTex": {"texture": 0}}},
            {"name": "wood", "textures": {"_MainTex": {"texture": 1, "scale": [2.0, 1.0]}}}
        ],
        "meshes": [{
            "positions": [0,0,0, 1,0,0, 1,1,0],
            "uvs": [0,0, 1,0, 1,1],
            "submeshes": [[0,1,2]]
        }],
        "surfaces": [
            {"id": 1, "mesh": 0, "materials": [0]},
            {"id": 2, "mesh": 0, "materials": [1],
             "transform": [1,0,0,0, 0,1,0,0, 0,0,1,0, 10,0,0,1]}
        ]
    }"#;

    #[test]
    fn loads_scene_with_file_and_solid_textures() {
        let dir = tempfile::tempdir().unwrap();
        RgbaImage::from_pixel(4, 2, Rgba([1, 2, 3, 255]))
            .save(dir.path().join("wood.png"))
            .unwrap();
        let path = dir.path().join("scene.json");
        std::fs::write(&path, SCENE).unwrap();

        let scene = load_scene(&path).unwrap();
        assert_eq!(scene.library.textures[0].width, 8);
        assert_eq!(scene.library.textures[1].width, 4);
        assert_eq!(scene.library.textures[1].mime_type, "image/png");
        assert_eq!(scene.library.materials[1].textures["_MainTex"].scale, [2.0, 1.0]);

        // World bounds were refreshed from the transform
        let moved = scene.surface(SurfaceId(2)).unwrap();
        assert_eq!(moved.world_bounds.min[0], 10.0);

        let stats = compute_stats(&scene);
        assert_eq!(stats.surfaces, 2);
        assert_eq!(stats.total_vertices, 3);
        assert_eq!(stats.skinned_surfaces, 0);
    }

    #[test]
    fn missing_file_and_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_scene(&dir.path().join("nope.json")),
            Err(BakeError::Io(_))
        ));

        let file: SceneFile =
            serde_json::from_str(r#"{"surfaces": [{"id": 1, "mesh": null}, {"id": 1, "mesh": null}]}"#).unwrap();
        let err = resolve(file, dir.path()).unwrap_err();
        assert!(matches!(err, BakeError::InputIntegrity { index: 1, .. }));
    }

    #[test]
    fn missing_texture_file_is_texture_error() {
        let dir = tempfile::tempdir().unwrap();
        let file: SceneFile =
            serde_json::from_str(r#"{"textures": [{"path": "gone.png"}], "surfaces": []}"#).unwrap();
        assert!(matches!(resolve(file, dir.path()), Err(BakeError::Texture(_))));
    }
}
