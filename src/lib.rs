pub mod atlas;
pub mod combine;
pub mod config;
pub mod error;
pub mod grouping;
pub mod inspect;
pub mod pipeline;
pub mod scene;
pub mod schedule;
pub mod store;
pub mod types;

pub use config::{BakeConfig, ClusterConfig, CombineConfig, PackingConfig, PipelineConfig, TilingConfig};
pub use error::{BakeError, Result, Warning};
pub use pipeline::Pipeline;
