//! Bottom-up (centroid linkage) hierarchical clustering.
//!
//! The dendrogram is built once; grouping at a given distance is a cheap
//! horizontal cut that can be re-evaluated for any threshold.

use std::time::Duration;

use glam::DVec3;
use tracing::debug;

use crate::config::AgglomerativeParams;
use crate::error::{BakeError, Result};
use crate::inspect;
use crate::schedule::{self, CancelToken, FrameBudget, Resumable, StepStatus};
use crate::types::{Surface, SurfaceId};

use super::{ClusterKey, ClusterMap, Grouper};

/// A dendrogram node. Leaves carry the surface they stand for.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub centroid: DVec3,
    /// Merge distance of this node's children, clamped so it never decreases
    /// towards the root. Zero for leaves.
    pub distance_to_merged_centroid: f64,
    /// Leaves are 0; a parent is one above its taller child.
    pub height: u32,
    pub left: Option<usize>,
    pub right: Option<usize>,
    pub surface: Option<SurfaceId>,
    pub leaf_count: usize,
}

impl ClusterNode {
    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

/// A finished dendrogram stored as an arena of nodes.
#[derive(Debug, Clone, Default)]
pub struct ClusterTree {
    pub nodes: Vec<ClusterNode>,
    pub root: Option<usize>,
}

impl ClusterTree {
    pub fn leaf_count(&self) -> usize {
        self.root.map_or(0, |r| self.nodes[r].leaf_count)
    }

    /// Surfaces under `node`, in ascending id order.
    pub fn leaves_under(&self, node: usize) -> Vec<SurfaceId> {
        let mut out = Vec::with_capacity(self.nodes[node].leaf_count);
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            let node = &self.nodes[n];
            if let Some(id) = node.surface {
                out.push(id);
            }
            stack.extend(node.right);
            stack.extend(node.left);
        }
        out.sort();
        out
    }

    /// Highest nodes whose merge distance is within `max_distance`.
    ///
    /// Descendants of a selected node are never selected, so every leaf is in
    /// exactly one group.
    pub fn cut(&self, max_distance: f64) -> Vec<usize> {
        let mut selected = Vec::new();
        let Some(root) = self.root else {
            return selected;
        };
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            let node = &self.nodes[n];
            if node.distance_to_merged_centroid <= max_distance || node.is_leaf() {
                selected.push(n);
            } else {
                stack.extend(node.right);
                stack.extend(node.left);
            }
        }
        selected
    }

    /// Cut at `max_distance` and name each group after its smallest surface id.
    pub fn groups(&self, max_distance: f64) -> ClusterMap {
        self.cut(max_distance)
            .into_iter()
            .map(|n| {
                let members = self.leaves_under(n);
                (ClusterKey(format!("cluster({})", members[0].0)), members)
            })
            .collect()
    }

    /// Surface ids of all leaves, sorted.
    pub fn surface_ids(&self) -> Vec<SurfaceId> {
        self.root.map(|r| self.leaves_under(r)).unwrap_or_default()
    }
}

enum Phase {
    /// Computing each leaf's nearest neighbour; the cursor is the next leaf.
    Seed(usize),
    Merge,
    Done,
}

/// Resumable dendrogram construction.
///
/// Each merge is one unit of work, so a large build can be spread across
/// frames and canceled between merges.
pub struct ClusterTreeBuilder {
    nodes: Vec<ClusterNode>,
    alive: Vec<bool>,
    /// Cached nearest alive neighbour (distance, node) per alive node.
    nearest: Vec<Option<(f64, usize)>>,
    alive_count: usize,
    phase: Phase,
    cancel: CancelToken,
    error: Option<BakeError>,
}

impl ClusterTreeBuilder {
    pub fn new(points: &[(SurfaceId, [f64; 3])], cancel: CancelToken) -> Self {
        let nodes: Vec<ClusterNode> = points
            .iter()
            .map(|&(id, c)| ClusterNode {
                centroid: DVec3::from_array(c),
                distance_to_merged_centroid: 0.0,
                height: 0,
                left: None,
                right: None,
                surface: Some(id),
                leaf_count: 1,
            })
            .collect();
        let n = nodes.len();
        Self {
            nodes,
            alive: vec![true; n],
            nearest: vec![None; n],
            alive_count: n,
            phase: if n == 0 { Phase::Done } else { Phase::Seed(0) },
            cancel,
            error: None,
        }
    }

    pub fn from_surfaces(surfaces: &[&Surface], cancel: CancelToken) -> Self {
        let points: Vec<_> = surfaces
            .iter()
            .map(|s| (s.id, inspect::center(s)))
            .collect();
        Self::new(&points, cancel)
    }

    fn nearest_alive(&self, node: usize) -> Option<(f64, usize)> {
        let c = self.nodes[node].centroid;
        let mut best: Option<(f64, usize)> = None;
        for (other, &alive) in self.alive.iter().enumerate() {
            if !alive || other == node {
                continue;
            }
            let d = c.distance(self.nodes[other].centroid);
            if best.is_none_or(|(bd, _)| d < bd) {
                best = Some((d, other));
            }
        }
        best
    }

    /// Merge the globally closest pair. Returns false once a single root remains.
    fn merge_closest(&mut self) -> bool {
        if self.alive_count <= 1 {
            return false;
        }

        let mut pick: Option<(f64, usize, usize)> = None;
        for (i, entry) in self.nearest.iter().enumerate() {
            if !self.alive[i] {
                continue;
            }
            if let Some((d, j)) = *entry {
                if pick.is_none_or(|(pd, _, _)| d < pd) {
                    pick = Some((d, i, j));
                }
            }
        }
        let Some((raw_distance, a, b)) = pick else {
            return false;
        };

        let (na, nb) = (&self.nodes[a], &self.nodes[b]);
        let count = na.leaf_count + nb.leaf_count;
        let centroid = (na.centroid * na.leaf_count as f64 + nb.centroid * nb.leaf_count as f64)
            / count as f64;
        let distance = raw_distance
            .max(na.distance_to_merged_centroid)
            .max(nb.distance_to_merged_centroid);
        let (left, right) = if a < b { (a, b) } else { (b, a) };
        let merged = ClusterNode {
            centroid,
            distance_to_merged_centroid: distance,
            height: na.height.max(nb.height) + 1,
            left: Some(left),
            right: Some(right),
            surface: None,
            leaf_count: count,
        };

        let k = self.nodes.len();
        self.nodes.push(merged);
        self.alive[a] = false;
        self.alive[b] = false;
        self.nearest[a] = None;
        self.nearest[b] = None;
        self.alive.push(true);
        self.nearest.push(None);
        self.alive_count -= 1;

        let merged_centroid = self.nodes[k].centroid;
        for m in 0..k {
            if !self.alive[m] {
                continue;
            }
            match self.nearest[m] {
                Some((_, n)) if n == a || n == b => self.nearest[m] = self.nearest_alive(m),
                Some((d, _)) => {
                    let dk = self.nodes[m].centroid.distance(merged_centroid);
                    if dk < d {
                        self.nearest[m] = Some((dk, k));
                    }
                }
                None => self.nearest[m] = self.nearest_alive(m),
            }
        }
        self.nearest[k] = self.nearest_alive(k);
        true
    }

    fn root(&self) -> Option<usize> {
        self.alive.iter().rposition(|&a| a)
    }
}

impl Resumable for ClusterTreeBuilder {
    type Output = ClusterTree;

    fn step(&mut self, budget: Duration) -> StepStatus {
        let budget = FrameBudget::start(budget);
        loop {
            if let Err(e) = schedule::check_canceled(&self.cancel) {
                self.error = Some(e);
                return StepStatus::Failed;
            }
            match self.phase {
                Phase::Seed(cursor) => {
                    self.nearest[cursor] = self.nearest_alive(cursor);
                    self.phase = if cursor + 1 < self.alive.len() {
                        Phase::Seed(cursor + 1)
                    } else {
                        Phase::Merge
                    };
                }
                Phase::Merge => {
                    if !self.merge_closest() {
                        self.phase = Phase::Done;
                    }
                }
                Phase::Done => return StepStatus::Done,
            }
            if budget.exhausted() {
                return StepStatus::Pending;
            }
        }
    }

    fn finish(self) -> Result<ClusterTree> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if !matches!(self.phase, Phase::Done) {
            return Err(BakeError::Canceled);
        }
        let root = self.root();
        debug!(nodes = self.nodes.len(), "Dendrogram complete");
        Ok(ClusterTree {
            nodes: self.nodes,
            root,
        })
    }
}

/// Groups surfaces by cutting a centroid-linkage dendrogram.
pub struct AgglomerativeGrouper {
    params: AgglomerativeParams,
    prebuilt: Option<ClusterTree>,
}

impl AgglomerativeGrouper {
    pub fn new(params: AgglomerativeParams) -> Self {
        Self {
            params,
            prebuilt: None,
        }
    }

    /// Reuse a tree built earlier for the same surfaces; only the cut is redone.
    pub fn with_tree(params: AgglomerativeParams, tree: ClusterTree) -> Self {
        Self {
            params,
            prebuilt: Some(tree),
        }
    }
}

impl Grouper for AgglomerativeGrouper {
    fn group(&self, surfaces: &[&Surface], cancel: &CancelToken) -> Result<ClusterMap> {
        let mut ids: Vec<SurfaceId> = surfaces.iter().map(|s| s.id).collect();
        ids.sort();

        if let Some(tree) = &self.prebuilt {
            if tree.surface_ids() == ids {
                return Ok(tree.groups(self.params.max_distance));
            }
            debug!("Prebuilt dendrogram does not match input, rebuilding");
        }

        let builder = ClusterTreeBuilder::from_surfaces(surfaces, cancel.clone());
        let tree = schedule::run_blocking(builder)?;
        Ok(tree.groups(self.params.max_distance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::test_support::surface_at;

    fn points(coords: &[[f64; 3]]) -> Vec<(SurfaceId, [f64; 3])> {
        coords
            .iter()
            .enumerate()
            .map(|(i, &c)| (SurfaceId(i as u64), c))
            .collect()
    }

    fn build(coords: &[[f64; 3]]) -> ClusterTree {
        schedule::run_blocking(ClusterTreeBuilder::new(&points(coords), CancelToken::new()))
            .unwrap()
    }

    fn scattered() -> Vec<[f64; 3]> {
        let mut v = Vec::new();
        for i in 0..30u32 {
            let f = i as f64;
            v.push([(f * 7.3) % 23.0, (f * 3.1) % 11.0, (f * 5.7) % 17.0]);
        }
        v
    }

    #[test]
    fn two_well_separated_groups() {
        let tree = build(&[
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [100.0, 0.0, 0.0],
            [101.0, 0.0, 0.0],
        ]);
        assert_eq!(tree.leaf_count(), 5);

        let groups = tree.groups(5.0);
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups[&ClusterKey("cluster(0)".into())],
            vec![SurfaceId(0), SurfaceId(1), SurfaceId(2)]
        );
        assert_eq!(
            groups[&ClusterKey("cluster(3)".into())],
            vec![SurfaceId(3), SurfaceId(4)]
        );

        assert_eq!(tree.groups(1000.0).len(), 1);
        assert_eq!(tree.groups(0.0).len(), 5);
    }

    #[test]
    fn merge_distances_are_monotone() {
        let tree = build(&scattered());
        for node in &tree.nodes {
            for child in [node.left, node.right].into_iter().flatten() {
                assert!(
                    tree.nodes[child].distance_to_merged_centroid
                        <= node.distance_to_merged_centroid
                );
                assert!(tree.nodes[child].height < node.height);
            }
        }
    }

    #[test]
    fn lower_threshold_refines_higher() {
        let tree = build(&scattered());
        let fine = tree.groups(2.0);
        let coarse = tree.groups(6.0);
        assert!(fine.len() >= coarse.len());

        // Every coarse group is a union of fine groups
        for members in coarse.values() {
            for fine_members in fine.values() {
                let inside = fine_members.iter().filter(|id| members.contains(id)).count();
                assert!(inside == 0 || inside == fine_members.len());
            }
        }

        // Every leaf is in exactly one group
        let total: usize = fine.values().map(Vec::len).sum();
        assert_eq!(total, 30);
    }

    #[test]
    fn sliced_build_matches_blocking() {
        let coords = scattered();
        let blocking = build(&coords);
        let builder = ClusterTreeBuilder::new(&points(&coords), CancelToken::new());
        let (sliced, frames) = schedule::run_sliced(builder, Duration::ZERO).unwrap();
        assert!(frames > 1);
        assert_eq!(blocking.groups(3.0), sliced.groups(3.0));
    }

    #[test]
    fn canceled_build_yields_no_tree() {
        let cancel = CancelToken::new();
        let mut builder = ClusterTreeBuilder::new(&points(&scattered()), cancel.clone());
        assert_eq!(builder.step(Duration::ZERO), StepStatus::Pending);
        cancel.cancel();
        assert_eq!(builder.step(Duration::ZERO), StepStatus::Failed);
        assert!(matches!(builder.finish(), Err(BakeError::Canceled)));
    }

    #[test]
    fn prebuilt_tree_is_recut() {
        let a = surface_at(0, [0.0; 3]);
        let b = surface_at(1, [3.0, 0.0, 0.0]);
        let refs = [&a, &b];
        let tree = schedule::run_blocking(ClusterTreeBuilder::from_surfaces(
            &refs,
            CancelToken::new(),
        ))
        .unwrap();

        let near = AgglomerativeGrouper::with_tree(AgglomerativeParams { max_distance: 1.0 }, tree.clone());
        let far = AgglomerativeGrouper::with_tree(AgglomerativeParams { max_distance: 10.0 }, tree);
        assert_eq!(near.group(&refs, &CancelToken::new()).unwrap().len(), 2);
        assert_eq!(far.group(&refs, &CancelToken::new()).unwrap().len(), 1);
    }

    #[test]
    fn empty_and_single_inputs() {
        let tree = build(&[]);
        assert!(tree.root.is_none());
        assert!(tree.groups(1.0).is_empty());

        let tree = build(&[[1.0, 2.0, 3.0]]);
        assert_eq!(tree.groups(0.0).len(), 1);
    }
}
