use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::atlas::{ClusterAtlas, TextureBakeJob};
use crate::combine::{DestinationMesh, MeshCombiner, VertexChannels};
use crate::config::{self, BakeConfig, PipelineConfig};
use crate::error::Result;
use crate::grouping::{self, ClusterMap};
use crate::inspect;
use crate::scene;
use crate::schedule::{self, CancelToken};
use crate::types::{BoneId, BoundingBox, MeshData, Scene, SurfaceId};

/// Summary of a completed pipeline run.
#[derive(Debug)]
pub struct ProcessingResult {
    pub clusters: usize,
    pub surfaces: usize,
    pub destination_meshes: usize,
    pub warnings: usize,
    /// Scheduler steps the texture bake took; 1 when not time-sliced.
    pub frames: usize,
    pub duration: Duration,
}

/// Combined mesh as written to disk.
#[derive(Serialize)]
struct MeshFile<'a> {
    name: &'a str,
    bounds: &'a BoundingBox,
    bones: &'a [BoneId],
    mesh: &'a MeshData,
}

/// Pipeline orchestrator -- drives the four baking stages.
pub struct Pipeline;

impl Pipeline {
    /// Run the full bake pipeline.
    pub fn run(config: &PipelineConfig) -> Result<ProcessingResult> {
        let start = Instant::now();

        info!(input = %config.input.display(), "Starting pipeline");

        let bake = resolve_settings(config)?;
        bake.validate()?;

        info!("Stage 1/4: Loading scene");
        let mut scene = scene::load_scene(&config.input)?;
        print_scene_summary(&scene);

        info!("Stage 2/4: Grouping");
        let cancel = CancelToken::new();
        let clusters = grouping::group_with_cancel(&scene.surfaces, &bake.clustering, &cancel)?;
        print_cluster_summary(&scene, &clusters);

        if config.dry_run {
            info!("--dry-run: stopping before the bake");
            return Ok(ProcessingResult {
                clusters: clusters.len(),
                surfaces: clusters.values().map(Vec::len).sum(),
                destination_meshes: 0,
                warnings: 0,
                frames: 0,
                duration: start.elapsed(),
            });
        }

        info!("Stage 3/4: Texture bake");
        let (atlases, frames) = {
            let job = TextureBakeJob::new(&scene, &bake, &clusters, cancel)?;
            if config.time_sliced {
                schedule::run_sliced(job, bake.max_time_per_frame())?
            } else {
                (schedule::run_blocking(job)?, 1)
            }
        };
        info!(clusters = atlases.len(), frames, "Texture bake complete");

        info!("Stage 4/4: Combining meshes");
        std::fs::create_dir_all(&config.output)?;
        let mut destination_meshes = 0;
        let mut warnings = 0;
        for atlas in &atlases {
            let members = clusters.get(&atlas.cluster).map(Vec::as_slice).unwrap_or_default();
            let dir = config.output.join(dir_name(atlas.cluster.as_str()));
            std::fs::create_dir_all(&dir)?;

            let (written, cluster_warnings) =
                combine_cluster(&mut scene, &bake, atlas, members, &dir, config)?;
            destination_meshes += written;
            warnings += cluster_warnings;
        }

        let duration = start.elapsed();
        let surfaces = clusters.values().map(Vec::len).sum();
        info!(
            clusters = atlases.len(),
            surfaces,
            destination_meshes,
            elapsed = ?duration,
            "Pipeline complete"
        );

        Ok(ProcessingResult {
            clusters: atlases.len(),
            surfaces,
            destination_meshes,
            warnings,
            frames,
            duration,
        })
    }
}

/// Apply the shared settings file, when one is given, over the CLI settings.
fn resolve_settings(config: &PipelineConfig) -> Result<BakeConfig> {
    match &config.settings {
        Some(path) => {
            let shared = config::load_bake_settings(path)?;
            info!(settings = %path.display(), "Using shared bake settings");
            Ok(config.bake.with_shared_from(&shared))
        }
        None => Ok(config.bake.clone()),
    }
}

/// Combine one baked cluster and write its outputs to `dir`.
///
/// Returns the number of destination meshes and warnings.
fn combine_cluster(
    scene: &mut Scene,
    bake: &BakeConfig,
    atlas: &ClusterAtlas,
    members: &[SurfaceId],
    dir: &Path,
    config: &PipelineConfig,
) -> Result<(usize, usize)> {
    let estimate = inspect::estimate_vertex_count(scene, members);
    let mut combiner = MeshCombiner::new(atlas.cluster.as_str(), atlas.result.clone(), bake.combining.clone())?
        .with_mode(bake.combining.mode_for_estimate(estimate));
    debug!(cluster = %atlas.cluster, estimate, mode = ?combiner.mode(), "Combiner ready");

    let report = combiner.add(scene, members, bake.combining.disable_source_rendering)?;
    for w in atlas.warnings.iter().chain(&report.warnings) {
        warn!(cluster = %atlas.cluster, "{w}");
    }

    let destinations = combiner.apply(VertexChannels::all(), &scene.bones);

    atlas.result.save(&dir.join("bake_result.json"))?;
    let mut files: Vec<PathBuf> = Vec::new();
    for page in &atlas.pages {
        files.extend(page.write(dir, config.atlas_format)?);
    }
    for dest in destinations {
        files.push(write_mesh(dir, dest)?);
    }
    debug!(cluster = %atlas.cluster, files = files.len(), "Cluster written");

    Ok((destinations.len(), atlas.warnings.len() + report.warnings.len()))
}

fn write_mesh(dir: &Path, dest: &DestinationMesh) -> Result<PathBuf> {
    let path = dir.join(format!("{}.mesh.json", dir_name(&dest.name)));
    let file = MeshFile {
        name: &dest.name,
        bounds: &dest.bounds,
        bones: &dest.bones,
        mesh: &dest.mesh,
    };
    std::fs::write(&path, serde_json::to_string(&file)?)?;
    Ok(path)
}

/// Cluster keys may contain characters that are awkward in paths.
fn dir_name(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Print scene statistics.
fn print_scene_summary(scene: &Scene) {
    let stats = scene::compute_stats(scene);
    println!("=== Scene ===");
    println!("  Surfaces:  {}", stats.surfaces);
    println!("  Meshes:    {}", stats.meshes);
    println!("  Vertices:  {}", stats.total_vertices);
    println!("  Triangles: {}", stats.total_triangles);
    println!("  Materials: {}", stats.materials);
    println!("  Textures:  {}", stats.textures);
    println!("  Skinned:   {}", stats.skinned_surfaces);
}

/// Print each cluster with its member count and vertex estimate.
fn print_cluster_summary(scene: &Scene, clusters: &ClusterMap) {
    println!("=== Clusters ({}) ===", clusters.len());
    for (key, members) in clusters {
        println!(
            "  {:<24} {:>4} surfaces  ~{} vertices",
            key.as_str(),
            members.len(),
            inspect::estimate_vertex_count(scene, members)
        );
    }
}
