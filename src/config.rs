use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::combine::channels::VertexChannels;
use crate::error::{BakeError, Result};
use crate::types::MaterialId;

/// Bin-packing backend used to lay out atlas pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PackingAlgorithm {
    /// Guillotine/shelf packer with direct pixel copy and edge bleed.
    #[default]
    #[value(name = "guillotine")]
    Guillotine,
    /// Same placement, rasterized by scaling each source through a compositing pass.
    #[value(name = "fast")]
    Fast,
}

impl std::fmt::Display for PackingAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackingAlgorithm::Guillotine => write!(f, "guillotine"),
            PackingAlgorithm::Fast => write!(f, "fast"),
        }
    }
}

/// Shape of the texture output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    #[default]
    #[value(name = "atlas")]
    Atlas,
    #[value(name = "texture-array")]
    TextureArray,
}

impl std::fmt::Display for ResultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultType::Atlas => write!(f, "atlas"),
            ResultType::TextureArray => write!(f, "texture-array"),
        }
    }
}

/// Encoded image format for written atlas pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum AtlasFormat {
    #[default]
    #[value(name = "png")]
    Png,
    #[value(name = "webp")]
    WebP,
}

impl std::fmt::Display for AtlasFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AtlasFormat::Png => write!(f, "png"),
            AtlasFormat::WebP => write!(f, "webp"),
        }
    }
}

/// Caller-assigned combined material and the sources it replaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomResultMaterial {
    pub name: String,
    pub sources: Vec<MaterialId>,
}

/// Atlas packing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackingConfig {
    /// Pixels of bleed around every packed entry.
    pub padding: u32,
    pub max_atlas_size: u32,
    /// Overrides `max_atlas_size` for the width only.
    pub max_atlas_width: Option<u32>,
    /// Overrides `max_atlas_size` for the height only.
    pub max_atlas_height: Option<u32>,
    /// Snap atlas dimensions to powers of two.
    pub power_of_two: bool,
    pub algorithm: PackingAlgorithm,
    pub result_type: ResultType,
    /// Split oversized or tiling-incompatible material sets into extra result materials.
    pub multi_material: bool,
    /// Explicit result-material assignment; when non-empty it replaces automatic grouping.
    pub custom_result_materials: Vec<CustomResultMaterial>,
    /// Edge length of the solid-color image used for unset texture properties.
    pub placeholder_size: u32,
}

impl Default for PackingConfig {
    fn default() -> Self {
        Self {
            padding: 2,
            max_atlas_size: 4096,
            max_atlas_width: None,
            max_atlas_height: None,
            power_of_two: true,
            algorithm: PackingAlgorithm::Guillotine,
            result_type: ResultType::Atlas,
            multi_material: false,
            custom_result_materials: Vec::new(),
            placeholder_size: 16,
        }
    }
}

impl PackingConfig {
    pub fn max_width(&self) -> u32 {
        self.max_atlas_width.unwrap_or(self.max_atlas_size)
    }

    pub fn max_height(&self) -> u32 {
        self.max_atlas_height.unwrap_or(self.max_atlas_size)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_width() == 0 {
            return Err(BakeError::config("packing.max_atlas_width", "must be > 0"));
        }
        if self.max_height() == 0 {
            return Err(BakeError::config("packing.max_atlas_height", "must be > 0"));
        }
        if self.placeholder_size == 0 {
            return Err(BakeError::config("packing.placeholder_size", "must be > 0"));
        }
        let min_side = self.max_width().min(self.max_height());
        if self.padding * 2 >= min_side {
            return Err(BakeError::config(
                "packing.padding",
                format!(
                    "padding {} leaves no room inside a {min_side}px atlas",
                    self.padding
                ),
            ));
        }
        self.validate_custom_result_materials()
    }

    /// Target names must be unique and non-empty; no source may feed two targets.
    fn validate_custom_result_materials(&self) -> Result<()> {
        let mut names = std::collections::BTreeSet::new();
        let mut owner: std::collections::BTreeMap<MaterialId, &str> = Default::default();
        for custom in &self.custom_result_materials {
            if custom.name.is_empty() {
                return Err(BakeError::config(
                    "packing.custom_result_materials",
                    "result material name must not be empty",
                ));
            }
            if !names.insert(custom.name.as_str()) {
                return Err(BakeError::config(
                    "packing.custom_result_materials",
                    format!("duplicate result material '{}'", custom.name),
                ));
            }
            if custom.sources.is_empty() {
                return Err(BakeError::config(
                    "packing.custom_result_materials",
                    format!("result material '{}' has no source materials", custom.name),
                ));
            }
            for &source in &custom.sources {
                if let Some(previous) = owner.insert(source, custom.name.as_str()) {
                    return Err(BakeError::config(
                        "packing.custom_result_materials",
                        format!(
                            "{source} is assigned to both '{previous}' and '{}'",
                            custom.name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Handling of meshes that sample outside the unit texture square.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    /// Largest edge, in pixels, of an oversampled (tiled) capture.
    pub max_tiling_bake_size: u32,
    /// Use the meshes' actual UV bounds when sizing sampling rects.
    pub consider_surface_uvs: bool,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            max_tiling_bake_size: 1024,
            consider_surface_uvs: true,
        }
    }
}

impl TilingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_tiling_bake_size == 0 {
            return Err(BakeError::config("tiling.max_tiling_bake_size", "must be > 0"));
        }
        Ok(())
    }
}

/// Regular 3-D grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridParams {
    #[serde(default)]
    pub origin: [f64; 3],
    pub cell_size: [f64; 3],
}

/// Angular segments and concentric rings around an axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieParams {
    #[serde(default)]
    pub origin: [f64; 3],
    pub axis: [f64; 3],
    pub segments: u32,
    pub ring_spacing: f64,
    /// Collapse every segment of ring 0 into a single hub cell.
    #[serde(default)]
    pub combine_inner_ring: bool,
}

/// Dendrogram cut threshold for agglomerative clustering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgglomerativeParams {
    pub max_distance: f64,
}

fn default_kmeans_clusters() -> usize {
    20
}

fn default_kmeans_iterations() -> usize {
    10
}

/// Lloyd's k-means over surface centers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansParams {
    #[serde(default = "default_kmeans_clusters")]
    pub clusters: usize,
    #[serde(default = "default_kmeans_iterations")]
    pub iterations: usize,
    /// Fixed seed for reproducible grouping; `None` draws from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for KMeansParams {
    fn default() -> Self {
        Self {
            clusters: default_kmeans_clusters(),
            iterations: default_kmeans_iterations(),
            seed: None,
        }
    }
}

/// Spatial grouping strategy and its parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClusterStrategy {
    /// Everything in one cluster.
    #[default]
    None,
    Grid(GridParams),
    Pie(PieParams),
    Agglomerative(AgglomerativeParams),
    KMeans(KMeansParams),
}

impl ClusterStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterStrategy::None => "none",
            ClusterStrategy::Grid(_) => "grid",
            ClusterStrategy::Pie(_) => "pie",
            ClusterStrategy::Agglomerative(_) => "agglomerative",
            ClusterStrategy::KMeans(_) => "kmeans",
        }
    }

    /// Reject unusable numeric parameters before any grouping happens.
    pub fn validate(&self) -> Result<()> {
        match self {
            ClusterStrategy::None => Ok(()),
            ClusterStrategy::Grid(p) => {
                if p.cell_size.iter().any(|&c| !(c > 0.0 && c.is_finite())) {
                    return Err(BakeError::config(
                        "grid.cell_size",
                        format!("every component must be finite and > 0, got {:?}", p.cell_size),
                    ));
                }
                if p.origin.iter().any(|c| !c.is_finite()) {
                    return Err(BakeError::config("grid.origin", format!("must be finite, got {:?}", p.origin)));
                }
                Ok(())
            }
            ClusterStrategy::Pie(p) => {
                if p.segments == 0 {
                    return Err(BakeError::config("pie.segments", "must be > 0"));
                }
                if !(p.ring_spacing > 0.0 && p.ring_spacing.is_finite()) {
                    return Err(BakeError::config(
                        "pie.ring_spacing",
                        format!("must be finite and > 0, got {}", p.ring_spacing),
                    ));
                }
                if p.origin.iter().any(|c| !c.is_finite()) {
                    return Err(BakeError::config("pie.origin", format!("must be finite, got {:?}", p.origin)));
                }
                let len_sq: f64 = p.axis.iter().map(|a| a * a).sum();
                if !(len_sq > 1e-12) || !len_sq.is_finite() {
                    return Err(BakeError::config(
                        "pie.axis",
                        format!("cannot normalize {:?}", p.axis),
                    ));
                }
                Ok(())
            }
            ClusterStrategy::Agglomerative(p) => {
                if !(p.max_distance >= 0.0) {
                    return Err(BakeError::config(
                        "agglomerative.max_distance",
                        format!("must be >= 0, got {}", p.max_distance),
                    ));
                }
                Ok(())
            }
            ClusterStrategy::KMeans(p) => {
                if p.clusters == 0 {
                    return Err(BakeError::config("kmeans.clusters", "must be > 0"));
                }
                if p.iterations == 0 {
                    return Err(BakeError::config("kmeans.iterations", "must be > 0"));
                }
                Ok(())
            }
        }
    }
}

/// Grouping strategy plus cross-cutting post-filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub strategy: ClusterStrategy,
    pub split_by_lightmap: bool,
    pub split_by_lod: bool,
    pub drop_single_surface_clusters: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            strategy: ClusterStrategy::None,
            split_by_lightmap: false,
            split_by_lod: false,
            drop_single_surface_clusters: false,
        }
    }
}

/// What to do when a cluster exceeds the per-mesh vertex limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DestinationMode {
    /// One destination mesh; overflowing adds are rejected.
    #[value(name = "single")]
    Single,
    /// Open further destination meshes as each one fills up.
    #[value(name = "multi")]
    Multi,
    /// Start with one mesh and promote to multi on overflow.
    #[default]
    #[value(name = "auto")]
    Auto,
}

/// Refresh policy for combined skinned-mesh bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkinnedBoundsPolicy {
    /// Aggregate bone positions, padded by each bone's influence radius.
    #[default]
    BoneAggregate,
    /// Reproject each source surface's bind-pose bounds through its root bone.
    SourceSurfaces,
}

/// 16-bit index buffers address at most this many vertices.
pub const MAX_VERTICES_16BIT: usize = 65_535;

/// Mesh combining parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombineConfig {
    pub destination_mode: DestinationMode,
    pub max_vertices_per_mesh: usize,
    /// Channels written into the destination mesh.
    pub channels: VertexChannels,
    /// Check for submeshes sharing vertices before combining.
    pub robust_validation: bool,
    pub skip_bounds_recompute: bool,
    pub skinned_bounds: SkinnedBoundsPolicy,
    /// Transform source positions into world space.
    pub bake_world_space: bool,
    pub disable_source_rendering: bool,
}

impl Default for CombineConfig {
    fn default() -> Self {
        Self {
            destination_mode: DestinationMode::Auto,
            max_vertices_per_mesh: MAX_VERTICES_16BIT,
            channels: VertexChannels::all(),
            robust_validation: false,
            skip_bounds_recompute: false,
            skinned_bounds: SkinnedBoundsPolicy::BoneAggregate,
            bake_world_space: true,
            disable_source_rendering: false,
        }
    }
}

impl CombineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_vertices_per_mesh == 0 {
            return Err(BakeError::config("combine.max_vertices_per_mesh", "must be > 0"));
        }
        Ok(())
    }

    /// Resolve the destination mode from an estimate of the cluster's vertex count.
    pub fn mode_for_estimate(&self, estimated_vertices: usize) -> DestinationMode {
        match self.destination_mode {
            DestinationMode::Auto if estimated_vertices > self.max_vertices_per_mesh => {
                DestinationMode::Multi
            }
            DestinationMode::Auto => DestinationMode::Single,
            mode => mode,
        }
    }
}

/// Every knob of one bake invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BakeConfig {
    pub packing: PackingConfig,
    pub tiling: TilingConfig,
    pub clustering: ClusterConfig,
    pub combining: CombineConfig,
    /// Per-step budget for the time-sliced texture bake, in milliseconds.
    pub max_time_per_frame_ms: u64,
}

impl Default for BakeConfig {
    fn default() -> Self {
        Self {
            packing: PackingConfig::default(),
            tiling: TilingConfig::default(),
            clustering: ClusterConfig::default(),
            combining: CombineConfig::default(),
            max_time_per_frame_ms: 16,
        }
    }
}

impl BakeConfig {
    pub fn validate(&self) -> Result<()> {
        self.packing.validate()?;
        self.tiling.validate()?;
        self.clustering.strategy.validate()?;
        self.combining.validate()
    }

    pub fn max_time_per_frame(&self) -> Duration {
        Duration::from_millis(self.max_time_per_frame_ms)
    }

    /// Copy the texture-side settings of a shared bake profile into a copy of `self`.
    ///
    /// Clustering and combining stay per-baker.
    pub fn with_shared_from(&self, shared: &BakeConfig) -> BakeConfig {
        BakeConfig {
            packing: shared.packing.clone(),
            tiling: shared.tiling.clone(),
            clustering: self.clustering.clone(),
            combining: self.combining.clone(),
            max_time_per_frame_ms: shared.max_time_per_frame_ms,
        }
    }
}

/// Fully resolved pipeline configuration (constructed from CLI args).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Shared bake profile whose texture-side settings override `bake`.
    pub settings: Option<PathBuf>,
    pub bake: BakeConfig,
    pub atlas_format: AtlasFormat,
    /// Run the texture bake through the frame-budgeted scheduler instead of blocking.
    pub time_sliced: bool,
    pub dry_run: bool,
    pub verbose: bool,
    pub threads: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            output: PathBuf::new(),
            settings: None,
            bake: BakeConfig::default(),
            atlas_format: AtlasFormat::Png,
            time_sliced: false,
            dry_run: false,
            verbose: false,
            threads: None,
        }
    }
}

/// Grouping strategy selector for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StrategyArg {
    #[value(name = "none")]
    None,
    #[value(name = "grid")]
    Grid,
    #[value(name = "pie")]
    Pie,
    #[value(name = "agglomerative")]
    Agglomerative,
    #[value(name = "kmeans")]
    KMeans,
}

/// CLI argument definition (clap derive).
#[derive(Parser, Debug)]
#[command(
    name = "mesh-baker",
    about = "Cluster scene surfaces, pack their textures into atlases and combine their meshes",
    version
)]
pub struct CliArgs {
    /// Scene description (JSON)
    #[arg(short = 'i', long)]
    pub input: PathBuf,

    /// Output directory
    #[arg(short = 'o', long)]
    pub output: PathBuf,

    /// Shared bake profile (JSON); its packing and tiling settings win over the flags below
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Grouping strategy
    #[arg(long, value_enum, default_value = "none")]
    pub strategy: StrategyArg,

    /// Grid cell edge length (grid strategy)
    #[arg(long, default_value_t = 10.0)]
    pub cell_size: f64,

    /// Number of angular segments (pie strategy)
    #[arg(long, default_value_t = 8)]
    pub segments: u32,

    /// Distance between rings (pie strategy)
    #[arg(long, default_value_t = 10.0)]
    pub ring_spacing: f64,

    /// Dendrogram cut distance (agglomerative strategy)
    #[arg(long, default_value_t = 5.0)]
    pub max_distance: f64,

    /// Requested cluster count (kmeans strategy)
    #[arg(long, default_value_t = 20)]
    pub clusters: usize,

    /// Seed for kmeans initialisation
    #[arg(long)]
    pub seed: Option<u64>,

    /// Split clusters by lightmap index
    #[arg(long)]
    pub split_lightmap: bool,

    /// Split clusters by LOD level
    #[arg(long)]
    pub split_lod: bool,

    /// Pixels of padding between atlas entries
    #[arg(long, default_value_t = 2)]
    pub padding: u32,

    /// Max atlas dimension in pixels
    #[arg(long, default_value_t = 4096)]
    pub max_atlas_size: u32,

    /// Allow non-power-of-two atlas sizes
    #[arg(long)]
    pub no_power_of_two: bool,

    /// Atlas packing backend
    #[arg(long, value_enum, default_value = "guillotine")]
    pub packer: PackingAlgorithm,

    /// Texture output shape
    #[arg(long, value_enum, default_value = "atlas")]
    pub result_type: ResultType,

    /// Split oversized or incompatible material sets into several result materials
    #[arg(long)]
    pub multi_material: bool,

    /// Ignore mesh UVs when sizing sampling rects
    #[arg(long)]
    pub ignore_surface_uvs: bool,

    /// Destination mesh mode
    #[arg(long, value_enum, default_value = "auto")]
    pub mesh_mode: DestinationMode,

    /// Atlas image format
    #[arg(long, value_enum, default_value = "png")]
    pub atlas_format: AtlasFormat,

    /// Drive the texture bake through the frame scheduler
    #[arg(long)]
    pub time_sliced: bool,

    /// Per-frame budget for the time-sliced bake, in milliseconds
    #[arg(long, default_value_t = 16)]
    pub frame_budget_ms: u64,

    /// Group surfaces and report clusters only
    #[arg(long)]
    pub dry_run: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Worker thread count (default: all cores)
    #[arg(short = 'j', long)]
    pub threads: Option<usize>,
}

impl From<CliArgs> for PipelineConfig {
    fn from(args: CliArgs) -> Self {
        let strategy = match args.strategy {
            StrategyArg::None => ClusterStrategy::None,
            StrategyArg::Grid => ClusterStrategy::Grid(GridParams {
                origin: [0.0; 3],
                cell_size: [args.cell_size; 3],
            }),
            StrategyArg::Pie => ClusterStrategy::Pie(PieParams {
                origin: [0.0; 3],
                axis: [0.0, 1.0, 0.0],
                segments: args.segments,
                ring_spacing: args.ring_spacing,
                combine_inner_ring: false,
            }),
            StrategyArg::Agglomerative => ClusterStrategy::Agglomerative(AgglomerativeParams {
                max_distance: args.max_distance,
            }),
            StrategyArg::KMeans => ClusterStrategy::KMeans(KMeansParams {
                clusters: args.clusters,
                seed: args.seed,
                ..Default::default()
            }),
        };

        let bake = BakeConfig {
            packing: PackingConfig {
                padding: args.padding,
                max_atlas_size: args.max_atlas_size,
                power_of_two: !args.no_power_of_two,
                algorithm: args.packer,
                result_type: args.result_type,
                multi_material: args.multi_material,
                ..Default::default()
            },
            tiling: TilingConfig {
                consider_surface_uvs: !args.ignore_surface_uvs,
                ..Default::default()
            },
            clustering: ClusterConfig {
                strategy,
                split_by_lightmap: args.split_lightmap,
                split_by_lod: args.split_lod,
                drop_single_surface_clusters: false,
            },
            combining: CombineConfig {
                destination_mode: args.mesh_mode,
                ..Default::default()
            },
            max_time_per_frame_ms: args.frame_budget_ms,
        };

        PipelineConfig {
            input: args.input,
            output: args.output,
            settings: args.settings,
            bake,
            atlas_format: args.atlas_format,
            time_sliced: args.time_sliced,
            dry_run: args.dry_run,
            verbose: args.verbose,
            threads: args.threads,
        }
    }
}

/// Load a [`BakeConfig`] from a JSON settings file.
pub fn load_bake_settings(path: &std::path::Path) -> Result<BakeConfig> {
    let text = std::fs::read_to_string(path)?;
    let config: BakeConfig = serde_json::from_str(&text)?;
    config.validate()?;
    Ok(config)
}
