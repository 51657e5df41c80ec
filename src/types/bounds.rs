use glam::{DVec3, Mat4, Vec3};
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in 3-D.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl BoundingBox {
    /// An inverted box that any `encapsulate` call will replace.
    pub const EMPTY: BoundingBox = BoundingBox {
        min: [f64::INFINITY; 3],
        max: [f64::NEG_INFINITY; 3],
    };

    pub fn from_center_extents(center: [f64; 3], half: [f64; 3]) -> Self {
        BoundingBox {
            min: [center[0] - half[0], center[1] - half[1], center[2] - half[2]],
            max: [center[0] + half[0], center[1] + half[1], center[2] + half[2]],
        }
    }

    /// Centre point of the box.
    pub fn center(&self) -> [f64; 3] {
        [
            (self.min[0] + self.max[0]) * 0.5,
            (self.min[1] + self.max[1]) * 0.5,
            (self.min[2] + self.max[2]) * 0.5,
        ]
    }

    pub fn center_vec(&self) -> DVec3 {
        DVec3::from_array(self.center())
    }

    /// Half-extents along each axis.
    pub fn half_extents(&self) -> [f64; 3] {
        [
            (self.max[0] - self.min[0]) * 0.5,
            (self.max[1] - self.min[1]) * 0.5,
            (self.max[2] - self.min[2]) * 0.5,
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.min[0] > self.max[0] || self.min[1] > self.max[1] || self.min[2] > self.max[2]
    }

    /// Whether a point lies inside (or on the boundary of) the box.
    pub fn contains_point(&self, p: [f64; 3]) -> bool {
        p[0] >= self.min[0]
            && p[0] <= self.max[0]
            && p[1] >= self.min[1]
            && p[1] <= self.max[1]
            && p[2] >= self.min[2]
            && p[2] <= self.max[2]
    }

    /// Return the smallest box that contains both `self` and `other`.
    pub fn merge(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min: [
                self.min[0].min(other.min[0]),
                self.min[1].min(other.min[1]),
                self.min[2].min(other.min[2]),
            ],
            max: [
                self.max[0].max(other.max[0]),
                self.max[1].max(other.max[1]),
                self.max[2].max(other.max[2]),
            ],
        }
    }

    /// Grow to include a point.
    pub fn encapsulate(&mut self, p: [f64; 3]) {
        for a in 0..3 {
            self.min[a] = self.min[a].min(p[a]);
            self.max[a] = self.max[a].max(p[a]);
        }
    }

    /// Grow every side by `amount`.
    pub fn expanded(&self, amount: f64) -> BoundingBox {
        BoundingBox {
            min: [self.min[0] - amount, self.min[1] - amount, self.min[2] - amount],
            max: [self.max[0] + amount, self.max[1] + amount, self.max[2] + amount],
        }
    }

    /// Bounds of the eight transformed corners.
    pub fn transformed(&self, m: &Mat4) -> BoundingBox {
        let mut out = BoundingBox::EMPTY;
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 != 0 { self.max[0] } else { self.min[0] } as f32,
                if i & 2 != 0 { self.max[1] } else { self.min[1] } as f32,
                if i & 4 != 0 { self.max[2] } else { self.min[2] } as f32,
            );
            let p = m.transform_point3(corner);
            out.encapsulate([p.x as f64, p.y as f64, p.z as f64]);
        }
        out
    }

    /// Bounds of an interleaved `[x, y, z, ...]` position buffer.
    pub fn from_positions(positions: &[f32]) -> BoundingBox {
        let points: &[[f32; 3]] = bytemuck::cast_slice(&positions[..positions.len() / 3 * 3]);
        let mut out = BoundingBox::EMPTY;
        for p in points {
            out.encapsulate([p[0] as f64, p[1] as f64, p[2] as f64]);
        }
        out
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        BoundingBox {
            min: [0.0; 3],
            max: [0.0; 3],
        }
    }
}
