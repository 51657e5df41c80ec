use anyhow::Context;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use mesh_baker::config::{CliArgs, PipelineConfig};
use mesh_baker::pipeline::Pipeline;

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let filter = if args.verbose {
        EnvFilter::new("mesh_baker=debug")
    } else {
        EnvFilter::new("mesh_baker=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config: PipelineConfig = args.into();

    if let Some(threads) = config.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("Failed to configure rayon thread pool")?;
    }

    match Pipeline::run(&config) {
        Ok(result) => {
            if config.dry_run {
                println!(
                    "Dry run: {} surfaces in {} clusters",
                    result.surfaces, result.clusters
                );
            } else {
                println!(
                    "Done: {} clusters, {} destination meshes, {} warnings in {:.2}s ({} frames)",
                    result.clusters,
                    result.destination_meshes,
                    result.warnings,
                    result.duration.as_secs_f64(),
                    result.frames
                );
            }
            Ok(())
        }
        Err(e) => {
            error!(%e, "Pipeline failed");
            Err(anyhow::anyhow!(e)).context("mesh-baker pipeline failed")
        }
    }
}
