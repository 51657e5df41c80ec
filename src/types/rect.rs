use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in normalized texture space (or atlas space).
///
/// `x`/`y` is the minimum corner; `width`/`height` are non-negative extents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Tolerance used when comparing rect edges.
pub const RECT_EPSILON: f64 = 1e-5;

impl Default for Rect {
    fn default() -> Self {
        Rect::UNIT
    }
}

impl Rect {
    /// The full texture, `(0, 0, 1, 1)`.
    pub const UNIT: Rect = Rect {
        x: 0.0,
        y: 0.0,
        width: 1.0,
        height: 1.0,
    };

    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Rect {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_min_max(min: [f64; 2], max: [f64; 2]) -> Self {
        Rect {
            x: min[0],
            y: min[1],
            width: max[0] - min[0],
            height: max[1] - min[1],
        }
    }

    pub fn x_max(&self) -> f64 {
        self.x + self.width
    }

    pub fn y_max(&self) -> f64 {
        self.y + self.height
    }

    pub fn min(&self) -> [f64; 2] {
        [self.x, self.y]
    }

    pub fn size(&self) -> [f64; 2] {
        [self.width, self.height]
    }

    /// Whether `other` lies inside `self` (edges may touch).
    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.x >= self.x - RECT_EPSILON
            && other.y >= self.y - RECT_EPSILON
            && other.x_max() <= self.x_max() + RECT_EPSILON
            && other.y_max() <= self.y_max() + RECT_EPSILON
    }

    pub fn contains_point(&self, p: [f64; 2]) -> bool {
        p[0] >= self.x && p[0] <= self.x_max() && p[1] >= self.y && p[1] <= self.y_max()
    }

    /// Smallest rect containing both `self` and `other`.
    pub fn encapsulate(&self, other: &Rect) -> Rect {
        Rect::from_min_max(
            [self.x.min(other.x), self.y.min(other.y)],
            [self.x_max().max(other.x_max()), self.y_max().max(other.y_max())],
        )
    }

    /// Whether the interiors of the two rects intersect.
    pub fn overlaps(&self, other: &Rect) -> bool {
        self.x < other.x_max() - RECT_EPSILON
            && other.x < self.x_max() - RECT_EPSILON
            && self.y < other.y_max() - RECT_EPSILON
            && other.y < self.y_max() - RECT_EPSILON
    }

    /// Translate by a whole number of texture periods.
    pub fn shifted(&self, dx: f64, dy: f64) -> Rect {
        Rect {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }

    pub fn approx_eq(&self, other: &Rect) -> bool {
        (self.x - other.x).abs() < RECT_EPSILON
            && (self.y - other.y).abs() < RECT_EPSILON
            && (self.width - other.width).abs() < RECT_EPSILON
            && (self.height - other.height).abs() < RECT_EPSILON
    }
}
