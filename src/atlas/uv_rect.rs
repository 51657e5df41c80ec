//! Sampling-rect computation and tiling classification.
//!
//! A mesh whose UVs leave the unit square samples a wrapped texture. Before
//! its material can go into an atlas we need the smallest rect of source
//! texture space that covers every UV, and whether that rect can keep
//! wrapping once it sits inside the atlas.

use serde::{Deserialize, Serialize};

use crate::types::{Material, MeshData, RECT_EPSILON, Rect};

/// How a packed material's texture may wrap inside the atlas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TilingTreatment {
    /// UVs stay inside one texture period.
    #[default]
    None,
    /// Wraps horizontally; the entry spans the full atlas width.
    EdgeToEdgeX,
    /// Wraps vertically; the entry spans the full atlas height.
    EdgeToEdgeY,
    /// Wraps on both axes; the entry owns a whole atlas page.
    EdgeToEdgeXY,
    /// Wraps in a way the atlas cannot reproduce; the needed region is
    /// captured by oversampling instead.
    Unknown,
}

impl TilingTreatment {
    pub fn wraps_x(self) -> bool {
        matches!(self, TilingTreatment::EdgeToEdgeX | TilingTreatment::EdgeToEdgeXY)
    }

    pub fn wraps_y(self) -> bool {
        matches!(self, TilingTreatment::EdgeToEdgeY | TilingTreatment::EdgeToEdgeXY)
    }

    /// Whether two materials can share an atlas page.
    pub fn compatible_with(self, other: TilingTreatment) -> bool {
        self.pack_group() == other.pack_group()
    }

    /// Treatments in the same group pack onto the same page.
    pub(crate) fn pack_group(self) -> u8 {
        match self {
            TilingTreatment::None | TilingTreatment::Unknown => 0,
            TilingTreatment::EdgeToEdgeX => 1,
            TilingTreatment::EdgeToEdgeY => 2,
            TilingTreatment::EdgeToEdgeXY => 3,
        }
    }
}

impl std::fmt::Display for TilingTreatment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TilingTreatment::None => "none",
            TilingTreatment::EdgeToEdgeX => "edge-to-edge-x",
            TilingTreatment::EdgeToEdgeY => "edge-to-edge-y",
            TilingTreatment::EdgeToEdgeXY => "edge-to-edge-xy",
            TilingTreatment::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Bounds of the UVs referenced by `submesh` (every vertex when `None`).
///
/// Returns `None` when the mesh has no UVs or the submesh is empty.
pub fn mesh_uv_bounds(mesh: &MeshData, submesh: Option<usize>) -> Option<Rect> {
    if !mesh.has_uvs() {
        return None;
    }
    let mut min = [f64::INFINITY; 2];
    let mut max = [f64::NEG_INFINITY; 2];
    let mut visit = |vi: usize| {
        if let Some(uv) = mesh.uvs.get(vi * 2..vi * 2 + 2) {
            for a in 0..2 {
                min[a] = min[a].min(uv[a] as f64);
                max[a] = max[a].max(uv[a] as f64);
            }
        }
    };
    match submesh {
        Some(s) => mesh.submeshes.get(s)?.iter().for_each(|&i| visit(i as usize)),
        None => (0..mesh.uvs.len() / 2).for_each(&mut visit),
    }
    if min[0] > max[0] {
        return None;
    }
    Some(Rect::from_min_max(min, max))
}

/// Apply a material tiling transform (`uv * scale + offset`) to a UV rect.
pub fn transform_rect(uv_rect: &Rect, tiling: &Rect) -> Rect {
    let x0 = uv_rect.x * tiling.width + tiling.x;
    let x1 = uv_rect.x_max() * tiling.width + tiling.x;
    let y0 = uv_rect.y * tiling.height + tiling.y;
    let y1 = uv_rect.y_max() * tiling.height + tiling.y;
    Rect::from_min_max([x0.min(x1), y0.min(y1)], [x0.max(x1), y0.max(y1)])
}

/// Whole texture periods to subtract so the rect's minimum lies in `[0, 1)`.
pub fn cell_shift(rect: &Rect) -> [f64; 2] {
    [
        (rect.x + RECT_EPSILON).floor(),
        (rect.y + RECT_EPSILON).floor(),
    ]
}

/// Shift `rect` so its minimum corner lands in the first texture period.
pub fn normalize_to_first_cell(rect: &Rect) -> Rect {
    let [dx, dy] = cell_shift(rect);
    rect.shifted(-dx, -dy)
}

/// Whether `inner` fits in `outer` after sliding by a whole number of periods.
pub fn segment_contains_shifted(outer: (f64, f64), inner: (f64, f64)) -> bool {
    let k = (inner.0 - outer.0 + RECT_EPSILON).floor();
    inner.0 - k >= outer.0 - RECT_EPSILON && inner.1 - k <= outer.1 + RECT_EPSILON
}

/// Classify an encapsulated, first-cell-normalized sampling rect.
///
/// Returns the rect that must be captured from the source texture together
/// with the treatment. Only `Unknown` captures anything other than one full
/// texture period.
pub fn classify(combined: &Rect) -> (Rect, TilingTreatment) {
    if Rect::UNIT.contains_rect(combined) {
        return (Rect::UNIT, TilingTreatment::None);
    }
    let fits_x = segment_contains_shifted((0.0, 1.0), (combined.x, combined.x_max()));
    let fits_y = segment_contains_shifted((0.0, 1.0), (combined.y, combined.y_max()));
    let full_x = combined.width >= 1.0 - RECT_EPSILON;
    let full_y = combined.height >= 1.0 - RECT_EPSILON;

    match (fits_x, fits_y) {
        (false, true) => (Rect::UNIT, TilingTreatment::EdgeToEdgeX),
        (true, false) => (Rect::UNIT, TilingTreatment::EdgeToEdgeY),
        (false, false) if full_x && full_y => (Rect::UNIT, TilingTreatment::EdgeToEdgeXY),
        // Fits one period on both axes but not the first one; only reachable
        // for rects that were not normalized
        (true, true) => (Rect::UNIT, TilingTreatment::None),
        _ => (*combined, TilingTreatment::Unknown),
    }
}

/// Decide whether `candidate` is covered by what was baked for `encapsulating`.
///
/// Lets a surface be added against an existing atlas without repacking.
pub fn is_enclosed(treatment: TilingTreatment, encapsulating: &Rect, candidate: &Rect) -> bool {
    let x_ok = || {
        segment_contains_shifted(
            (encapsulating.x, encapsulating.x_max()),
            (candidate.x, candidate.x_max()),
        )
    };
    let y_ok = || {
        segment_contains_shifted(
            (encapsulating.y, encapsulating.y_max()),
            (candidate.y, candidate.y_max()),
        )
    };
    match treatment {
        TilingTreatment::EdgeToEdgeXY => true,
        TilingTreatment::EdgeToEdgeX => y_ok(),
        TilingTreatment::EdgeToEdgeY => x_ok(),
        TilingTreatment::None | TilingTreatment::Unknown => x_ok() && y_ok(),
    }
}

/// Sampling analysis for one material across every submesh that uses it.
#[derive(Debug, Clone, PartialEq)]
pub struct TilingInfo {
    /// Union of every user's tiled UV rect, each moved to the first period.
    pub encapsulating: Rect,
    pub sampling: Rect,
    pub treatment: TilingTreatment,
    pub material_tiling: Rect,
}

/// Analyze a material given the raw UV rects of the submeshes drawing it.
///
/// With `consider_surface_uvs` off every user is treated as covering the
/// unit square, so only the material's own tiling matters.
pub fn analyze_material<I>(material: &Material, user_uv_rects: I, consider_surface_uvs: bool) -> TilingInfo
where
    I: IntoIterator<Item = Rect>,
{
    let material_tiling = material.tiling_rect();
    let mut encapsulating: Option<Rect> = None;
    for uv_rect in user_uv_rects {
        let mesh_rect = if consider_surface_uvs { uv_rect } else { Rect::UNIT };
        let combined = normalize_to_first_cell(&transform_rect(&mesh_rect, &material_tiling));
        encapsulating = Some(match encapsulating {
            Some(e) => e.encapsulate(&combined),
            None => combined,
        });
    }
    let encapsulating = encapsulating
        .unwrap_or_else(|| normalize_to_first_cell(&transform_rect(&Rect::UNIT, &material_tiling)));

    let (sampling, treatment) = if material.shares_tiling() {
        classify(&encapsulating)
    } else {
        // Properties disagree on tiling, so no single wrap setting is valid
        (encapsulating, TilingTreatment::Unknown)
    };

    TilingInfo {
        encapsulating,
        sampling,
        treatment,
        material_tiling,
    }
}

/// Map a mesh UV into atlas space.
///
/// `uv` is first tiled by the material transform, moved into the first period
/// by `shift`, normalized against the sampled region and placed in `dest`.
pub fn remap_uv(uv: [f32; 2], tiling: &Rect, shift: [f64; 2], sampling: &Rect, dest: &Rect) -> [f32; 2] {
    let u = uv[0] as f64 * tiling.width + tiling.x - shift[0];
    let v = uv[1] as f64 * tiling.height + tiling.y - shift[1];
    let nu = (u - sampling.x) / sampling.width;
    let nv = (v - sampling.y) / sampling.height;
    [
        (dest.x + dest.width * nu) as f32,
        (dest.y + dest.height * nv) as f32,
    ]
}

/// Inverse of [`remap_uv`].
pub fn unmap_uv(uv: [f32; 2], tiling: &Rect, shift: [f64; 2], sampling: &Rect, dest: &Rect) -> [f32; 2] {
    let nu = (uv[0] as f64 - dest.x) / dest.width;
    let nv = (uv[1] as f64 - dest.y) / dest.height;
    let u = nu * sampling.width + sampling.x + shift[0];
    let v = nv * sampling.height + sampling.y + shift[1];
    [
        ((u - tiling.x) / tiling.width) as f32,
        ((v - tiling.y) / tiling.height) as f32,
    ]
}
