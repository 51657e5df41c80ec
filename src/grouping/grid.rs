use crate::config::GridParams;
use crate::error::Result;
use crate::inspect;
use crate::schedule::CancelToken;
use crate::types::Surface;

use super::{ClusterKey, ClusterMap, Grouper};

/// Buckets surfaces by the grid cell containing their bounds centre.
pub struct GridGrouper {
    params: GridParams,
}

impl GridGrouper {
    pub fn new(params: GridParams) -> Self {
        Self { params }
    }

    /// Minimum corner of the cell containing `point`, relative to the origin.
    pub fn cell_of(&self, point: [f64; 3]) -> [f64; 3] {
        let mut cell = [0.0; 3];
        for a in 0..3 {
            let size = self.params.cell_size[a];
            // `+ 0.0` folds -0.0 into 0.0 so the key is canonical
            cell[a] = ((point[a] - self.params.origin[a]) / size).floor() * size + 0.0;
        }
        cell
    }
}

/// Canonical key for a cell coordinate.
pub(crate) fn cell_key(cell: [f64; 3]) -> ClusterKey {
    ClusterKey(format!("cell({},{},{})", cell[0], cell[1], cell[2]))
}

impl Grouper for GridGrouper {
    fn group(&self, surfaces: &[&Surface], _cancel: &CancelToken) -> Result<ClusterMap> {
        let mut map = ClusterMap::new();
        for surface in surfaces {
            let cell = self.cell_of(inspect::center(surface));
            map.entry(cell_key(cell)).or_default().push(surface.id);
        }
        Ok(map)
    }
}
