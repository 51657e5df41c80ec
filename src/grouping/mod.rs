pub mod agglomerative;
pub mod grid;
pub mod kmeans;
pub mod pie;

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::config::{ClusterConfig, ClusterStrategy};
use crate::error::Result;
use crate::schedule::CancelToken;
use crate::types::{Surface, SurfaceId};

/// Name of a cluster, built deterministically from strategy-specific indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey(pub String);

impl ClusterKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClusterKey {
    fn from(s: &str) -> Self {
        ClusterKey(s.to_string())
    }
}

/// Cluster name -> member surfaces. Iteration order is the bake order.
pub type ClusterMap = BTreeMap<ClusterKey, Vec<SurfaceId>>;

/// One spatial grouping strategy.
pub trait Grouper {
    fn group(&self, surfaces: &[&Surface], cancel: &CancelToken) -> Result<ClusterMap>;
}

/// Puts every surface into one cluster.
pub struct SingleClusterGrouper;

impl Grouper for SingleClusterGrouper {
    fn group(&self, surfaces: &[&Surface], _cancel: &CancelToken) -> Result<ClusterMap> {
        let mut map = ClusterMap::new();
        if !surfaces.is_empty() {
            map.insert(
                ClusterKey::from("all"),
                surfaces.iter().map(|s| s.id).collect(),
            );
        }
        Ok(map)
    }
}

/// Select the grouper implementation for a strategy, validating its parameters.
pub fn grouper_for(strategy: &ClusterStrategy) -> Result<Box<dyn Grouper>> {
    strategy.validate()?;
    Ok(match strategy {
        ClusterStrategy::None => Box::new(SingleClusterGrouper),
        ClusterStrategy::Grid(p) => Box::new(grid::GridGrouper::new(p.clone())),
        ClusterStrategy::Pie(p) => Box::new(pie::PieGrouper::new(p.clone())),
        ClusterStrategy::Agglomerative(p) => {
            Box::new(agglomerative::AgglomerativeGrouper::new(p.clone()))
        }
        ClusterStrategy::KMeans(p) => Box::new(kmeans::KMeansGrouper::new(p.clone())),
    })
}

/// Partition `surfaces` into named clusters.
pub fn group(surfaces: &[Surface], config: &ClusterConfig) -> Result<ClusterMap> {
    group_with_cancel(surfaces, config, &CancelToken::new())
}

/// [`group`] with a cancellation signal for the agglomerative build.
pub fn group_with_cancel(
    surfaces: &[Surface],
    config: &ClusterConfig,
    cancel: &CancelToken,
) -> Result<ClusterMap> {
    let grouper = grouper_for(&config.strategy)?;
    let refs: Vec<&Surface> = surfaces.iter().collect();
    let mut clusters = grouper.group(&refs, cancel)?;

    if config.split_by_lightmap || config.split_by_lod {
        clusters = split_clusters(clusters, surfaces, config.split_by_lightmap, config.split_by_lod);
    }

    if config.drop_single_surface_clusters {
        let before = clusters.len();
        clusters.retain(|_, members| members.len() > 1);
        debug!(dropped = before - clusters.len(), "Dropped single-surface clusters");
    }

    for members in clusters.values_mut() {
        members.sort();
    }

    info!(
        strategy = config.strategy.name(),
        surfaces = surfaces.len(),
        clusters = clusters.len(),
        "Grouping complete"
    );
    Ok(clusters)
}

/// Re-split each cluster by lightmap index and/or LOD level, suffixing the key.
fn split_clusters(
    clusters: ClusterMap,
    surfaces: &[Surface],
    by_lightmap: bool,
    by_lod: bool,
) -> ClusterMap {
    let lookup: BTreeMap<SurfaceId, &Surface> = surfaces.iter().map(|s| (s.id, s)).collect();
    let mut out = ClusterMap::new();
    for (key, members) in clusters {
        for id in members {
            let Some(surface) = lookup.get(&id) else {
                continue;
            };
            let mut name = key.0.clone();
            if by_lightmap {
                match surface.lightmap_index {
                    Some(lm) => name.push_str(&format!("-LM{lm}")),
                    None => name.push_str("-LMnone"),
                }
            }
            if by_lod {
                match surface.lod_level {
                    Some(lod) => name.push_str(&format!("-LOD{lod}")),
                    None => name.push_str("-LODnone"),
                }
            }
            out.entry(ClusterKey(name)).or_default().push(id);
        }
    }
    out
}


#[cfg(test)]
mod tests {
    use super::test_support::surface_at;
    use super::*;
    use crate::config::GridParams;

    #[test]
    fn none_strategy_single_cluster() {
        let surfaces = vec![surface_at(1, [0.0; 3]), surface_at(2, [100.0; 3])];
        let map = group(&surfaces, &ClusterConfig::default()).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map[&ClusterKey::from("all")], vec![SurfaceId(1), SurfaceId(2)]);
    }

    #[test]
    fn empty_input_no_clusters() {
        let map = group(&[], &ClusterConfig::default()).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn split_by_lightmap_and_lod() {
        let mut a = surface_at(1, [0.0; 3]);
        a.lightmap_index = Some(0);
        a.lod_level = Some(0);
        let mut b = surface_at(2, [0.0; 3]);
        b.lightmap_index = Some(1);
        b.lod_level = Some(0);
        let mut c = surface_at(3, [0.0; 3]);
        c.lightmap_index = Some(1);
        c.lod_level = Some(0);

        let config = ClusterConfig {
            split_by_lightmap: true,
            split_by_lod: true,
            ..Default::default()
        };
        let map = group(&[a, b, c], &config).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&ClusterKey::from("all-LM0-LOD0")], vec![SurfaceId(1)]);
        assert_eq!(
            map[&ClusterKey::from("all-LM1-LOD0")],
            vec![SurfaceId(2), SurfaceId(3)]
        );
    }

    #[test]
    fn drop_single_member_clusters() {
        let surfaces = vec![
            surface_at(1, [0.5, 0.5, 0.5]),
            surface_at(2, [0.6, 0.5, 0.5]),
            surface_at(3, [5.5, 0.5, 0.5]),
        ];
        let config = ClusterConfig {
            strategy: ClusterStrategy::Grid(GridParams {
                origin: [0.0; 3],
                cell_size: [1.0; 3],
            }),
            drop_single_surface_clusters: true,
            ..Default::default()
        };
        let map = group(&surfaces, &config).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.values().next().unwrap().len(), 2);
    }

    #[test]
    fn invalid_strategy_returns_no_groups() {
        let config = ClusterConfig {
            strategy: ClusterStrategy::Grid(GridParams {
                origin: [0.0; 3],
                cell_size: [0.0, 1.0, 1.0],
            }),
            ..Default::default()
        };
        let result = group(&[surface_at(1, [0.0; 3])], &config);
        assert!(matches!(
            result,
            Err(crate::error::BakeError::Configuration { .. })
        ));
    }
}
