use glam::DVec3;
use rand::SeedableRng;
use rand::seq::index;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::debug;

use crate::config::KMeansParams;
use crate::error::Result;
use crate::inspect;
use crate::schedule::{self, CancelToken};
use crate::types::Surface;

use super::{ClusterKey, ClusterMap, Grouper};

/// Lloyd's k-means over surface centres.
///
/// Initial centroids are distinct surfaces drawn from a ChaCha stream, so a
/// fixed seed reproduces the same clusters for the same surface set.
pub struct KMeansGrouper {
    params: KMeansParams,
}

impl KMeansGrouper {
    pub fn new(params: KMeansParams) -> Self {
        Self { params }
    }

    fn rng(&self) -> ChaCha8Rng {
        match self.params.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        }
    }
}

fn nearest(point: DVec3, centroids: &[DVec3]) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = point.distance_squared(*c);
        if d < best_d {
            best_d = d;
            best = i;
        }
    }
    best
}

/// Run Lloyd iterations and return the cluster index of every point.
pub fn lloyd(
    points: &[DVec3],
    mut centroids: Vec<DVec3>,
    iterations: usize,
    cancel: &CancelToken,
) -> Result<Vec<usize>> {
    let mut assignment: Vec<usize> = vec![usize::MAX; points.len()];
    for iteration in 0..iterations {
        schedule::check_canceled(cancel)?;

        let next: Vec<usize> = points.par_iter().map(|&p| nearest(p, &centroids)).collect();
        if next == assignment {
            debug!(iteration, "k-means converged");
            break;
        }
        assignment = next;

        let mut sums = vec![DVec3::ZERO; centroids.len()];
        let mut counts = vec![0usize; centroids.len()];
        for (p, &c) in points.iter().zip(&assignment) {
            sums[c] += *p;
            counts[c] += 1;
        }
        for (i, centroid) in centroids.iter_mut().enumerate() {
            // An emptied cluster keeps its centroid
            if counts[i] > 0 {
                *centroid = sums[i] / counts[i] as f64;
            }
        }
    }
    Ok(assignment)
}

impl Grouper for KMeansGrouper {
    fn group(&self, surfaces: &[&Surface], cancel: &CancelToken) -> Result<ClusterMap> {
        let mut ordered: Vec<&Surface> = surfaces.to_vec();
        ordered.sort_by_key(|s| s.id);
        if ordered.is_empty() {
            return Ok(ClusterMap::new());
        }

        let points: Vec<DVec3> = ordered
            .iter()
            .map(|s| DVec3::from_array(inspect::center(s)))
            .collect();
        let k = self.params.clusters.min(points.len());

        let mut rng = self.rng();
        let mut seeds = index::sample(&mut rng, points.len(), k).into_vec();
        seeds.sort_unstable();
        let centroids: Vec<DVec3> = seeds.iter().map(|&i| points[i]).collect();

        let assignment = lloyd(&points, centroids, self.params.iterations, cancel)?;

        let mut map = ClusterMap::new();
        for (surface, cluster) in ordered.iter().zip(assignment) {
            map.entry(ClusterKey(format!("kmeans{cluster}")))
                .or_default()
                .push(surface.id);
        }
        debug!(requested = self.params.clusters, produced = map.len(), "k-means grouping");
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BakeError;
    use crate::grouping::test_support::surface_at;
    use crate::types::SurfaceId;

    fn members(map: &ClusterMap) -> Vec<SurfaceId> {
        let mut ids: Vec<SurfaceId> = map.values().flatten().copied().collect();
        ids.sort();
        ids
    }

    fn two_blobs() -> Vec<Surface> {
        let mut v = Vec::new();
        for i in 0..10u64 {
            let f = i as f64 * 0.1;
            v.push(surface_at(i, [f, 0.0, f]));
            v.push(surface_at(100 + i, [50.0 + f, 0.0, 50.0 - f]));
        }
        v
    }

    fn params(clusters: usize, seed: Option<u64>) -> KMeansParams {
        KMeansParams {
            clusters,
            iterations: 10,
            seed,
        }
    }

    #[test]
    fn separates_distant_blobs() {
        let surfaces = two_blobs();
        let refs: Vec<&Surface> = surfaces.iter().collect();
        let map = KMeansGrouper::new(params(2, Some(7)))
            .group(&refs, &CancelToken::new())
            .unwrap();
        assert_eq!(map.len(), 2);
        for ids in map.values() {
            let low = ids.iter().all(|id| id.0 < 100);
            let high = ids.iter().all(|id| id.0 >= 100);
            assert!(low || high, "mixed cluster {ids:?}");
        }
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let surfaces = two_blobs();
        let forward: Vec<&Surface> = surfaces.iter().collect();
        let reverse: Vec<&Surface> = surfaces.iter().rev().collect();
        let g = KMeansGrouper::new(params(5, Some(42)));
        let a = g.group(&forward, &CancelToken::new()).unwrap();
        let b = g.group(&reverse, &CancelToken::new()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn more_clusters_than_surfaces() {
        let a = surface_at(1, [0.0; 3]);
        let b = surface_at(2, [10.0, 0.0, 0.0]);
        let map = KMeansGrouper::new(params(20, Some(1)))
            .group(&[&a, &b], &CancelToken::new())
            .unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(members(&map), vec![SurfaceId(1), SurfaceId(2)]);
    }

    #[test]
    fn unseeded_still_covers_every_surface() {
        let surfaces = two_blobs();
        let refs: Vec<&Surface> = surfaces.iter().collect();
        let map = KMeansGrouper::new(params(3, None))
            .group(&refs, &CancelToken::new())
            .unwrap();
        assert_eq!(members(&map).len(), 20);
        assert!(map.len() <= 3);
        assert!(map.values().all(|ids| !ids.is_empty()));
    }

    #[test]
    fn cancel_aborts() {
        let surfaces = two_blobs();
        let refs: Vec<&Surface> = surfaces.iter().collect();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = KMeansGrouper::new(params(2, Some(3))).group(&refs, &cancel);
        assert!(matches!(result, Err(BakeError::Canceled)));
    }
}
