use std::io;

/// All error types for the mesh-baker pipeline.
#[derive(thiserror::Error, Debug)]
pub enum BakeError {
    /// A numeric or structural setting is unusable. Raised before any mutation.
    #[error("Configuration error: {parameter}: {reason}")]
    Configuration { parameter: String, reason: String },
    /// A specific input surface is unusable (missing, duplicated, no mesh or material).
    #[error("Input error: surface #{index} ({surface}): {reason}")]
    InputIntegrity {
        index: usize,
        surface: String,
        reason: String,
    },
    /// `update` was called with geometry whose layout differs from the last `add`.
    #[error("Topology mismatch for surface {surface}: {reason}")]
    TopologyMismatch { surface: String, reason: String },
    #[error("Capacity overflow: {count} vertices exceeds the limit of {limit}")]
    CapacityOverflow { count: usize, limit: usize },
    #[error("Material mapping error: {0}")]
    MaterialMapping(String),
    #[error("Texture error: {0}")]
    Texture(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Operation canceled")]
    Canceled,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BakeError {
    pub(crate) fn config(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        BakeError::Configuration {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn input(index: usize, surface: impl Into<String>, reason: impl Into<String>) -> Self {
        BakeError::InputIntegrity {
            index,
            surface: surface.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BakeError>;

/// Non-fatal findings collected during a bake for caller inspection.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// Two submeshes of one surface reference the same vertices.
    OverlappingSubmeshes {
        surface: String,
        pairs: Vec<(usize, usize)>,
    },
    /// The material wraps in a way the atlas cannot reproduce and was oversampled.
    OversampledTiling { material: String, property_count: usize },
    /// Tiling treatments could not share a page; the material was oversampled instead.
    DemotedTiling { material: String, from: String },
    /// A result material's entries were shrunk to fit the maximum atlas size.
    Downscaled { result_material: String, factor: u32 },
    /// A texture property has no image and was filled with a solid color.
    MissingTexture { material: String, property: String },
    /// A surface samples outside the region baked for its material.
    NotEnclosed { surface: String, material: String },
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::OverlappingSubmeshes { surface, pairs } => {
                write!(f, "{surface}: submeshes share vertices {pairs:?}")
            }
            Warning::OversampledTiling {
                material,
                property_count,
            } => write!(
                f,
                "{material}: tiling cannot wrap in the atlas, oversampled {property_count} properties"
            ),
            Warning::DemotedTiling { material, from } => {
                write!(f, "{material}: {from} tiling incompatible with its page, oversampled")
            }
            Warning::Downscaled {
                result_material,
                factor,
            } => write!(f, "{result_material}: entries downscaled by {factor}x to fit"),
            Warning::MissingTexture { material, property } => {
                write!(f, "{material}: no image for {property}, using solid color")
            }
            Warning::NotEnclosed { surface, material } => {
                write!(f, "{surface}: UVs exceed the region baked for {material}")
            }
        }
    }
}
