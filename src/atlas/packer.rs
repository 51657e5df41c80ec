//! Rectangle bin packing for atlas pages.
//!
//! Pixel sizes in, pixel placements out; no image data is touched here.

use tracing::{debug, warn};

use crate::config::{PackingAlgorithm, PackingConfig};
use crate::types::Rect;

use super::uv_rect::TilingTreatment;

/// Size constraints for one atlas page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackLimits {
    pub max_width: u32,
    pub max_height: u32,
    /// Bleed pixels on every side of an entry.
    pub padding: u32,
    pub power_of_two: bool,
}

impl PackLimits {
    pub fn from_config(config: &PackingConfig) -> Self {
        Self {
            max_width: config.max_width(),
            max_height: config.max_height(),
            padding: config.padding,
            power_of_two: config.power_of_two,
        }
    }

    /// Widest page allowed; rounded down to a power of two when required.
    pub fn width_limit(&self) -> u32 {
        self.side_limit(self.max_width)
    }

    pub fn height_limit(&self) -> u32 {
        self.side_limit(self.max_height)
    }

    fn side_limit(&self, max: u32) -> u32 {
        if self.power_of_two { power_of_two_floor(max) } else { max }
    }

    /// Page side for `value` pixels, never above `max` and a power of two when required.
    pub(crate) fn snap(&self, value: u32, max: u32) -> u32 {
        let v = value.max(1);
        let v = if self.power_of_two { v.next_power_of_two() } else { v };
        v.min(self.side_limit(max))
    }
}

/// Largest power of two not above `value`; 1 for 0.
fn power_of_two_floor(value: u32) -> u32 {
    1 << (u32::BITS - 1 - value.max(1).leading_zeros())
}

/// Content size of one entry, excluding padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackItem {
    pub key: usize,
    pub width: u32,
    pub height: u32,
}

/// Content rect of a placed entry, in pixels. Padding surrounds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub key: usize,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Placement {
    /// Placement in `[0, 1]` page coordinates.
    pub fn normalized(&self, page_width: u32, page_height: u32) -> Rect {
        let w = page_width as f64;
        let h = page_height as f64;
        Rect::new(
            self.x as f64 / w,
            self.y as f64 / h,
            self.width as f64 / w,
            self.height as f64 / h,
        )
    }
}

/// One packed atlas page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedPage {
    pub width: u32,
    pub height: u32,
    pub placements: Vec<Placement>,
    /// Content sizes were multiplied by `1 / 2^downscale` to fit.
    pub downscale: u32,
}

/// Page arrangement demanded by a tiling treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Free 2-D placement.
    Free,
    /// Full-width rows stacked vertically, for horizontal wrapping.
    RowsFullWidth,
    /// Full-height columns side by side, for vertical wrapping.
    ColumnsFullHeight,
    /// A single entry covering the entire page.
    WholePage,
}

impl Layout {
    pub fn for_treatment(treatment: TilingTreatment) -> Self {
        match treatment {
            TilingTreatment::None | TilingTreatment::Unknown => Layout::Free,
            TilingTreatment::EdgeToEdgeX => Layout::RowsFullWidth,
            TilingTreatment::EdgeToEdgeY => Layout::ColumnsFullHeight,
            TilingTreatment::EdgeToEdgeXY => Layout::WholePage,
        }
    }
}

/// A free rectangle in the guillotine packer.
#[derive(Debug, Clone)]
struct FreeRect {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
}

type PlaceFn = fn(&[PackItem], u32, u32, u32) -> Option<Vec<Placement>>;

/// Pack `items` onto one page, or `None` if they do not fit within `limits`.
pub fn pack(
    items: &[PackItem],
    layout: Layout,
    algorithm: PackingAlgorithm,
    limits: &PackLimits,
) -> Option<PackedPage> {
    if items.is_empty() {
        return Some(PackedPage {
            width: limits.snap(1, limits.width_limit()),
            height: limits.snap(1, limits.height_limit()),
            placements: Vec::new(),
            downscale: 0,
        });
    }
    match layout {
        Layout::Free => match algorithm {
            PackingAlgorithm::Guillotine => pack_free(items, limits, place_guillotine),
            PackingAlgorithm::Fast => pack_free(items, limits, place_shelves),
        },
        Layout::RowsFullWidth => pack_stacked(items, limits, false),
        Layout::ColumnsFullHeight => pack_stacked(items, limits, true),
        Layout::WholePage => pack_whole(items, limits),
    }
}

/// Pack `items`, splitting into several pages when `split` is set and
/// shrinking content when a page still cannot hold it.
pub fn pack_pages(
    items: &[PackItem],
    layout: Layout,
    algorithm: PackingAlgorithm,
    limits: &PackLimits,
    split: bool,
) -> Option<Vec<PackedPage>> {
    if let Some(page) = pack(items, layout, algorithm, limits) {
        return Some(vec![page]);
    }
    if split && items.len() > 1 {
        let (a, b) = items.split_at(items.len() / 2);
        debug!(left = a.len(), right = b.len(), "Splitting oversized atlas group");
        let mut pages = pack_pages(a, layout, algorithm, limits, split)?;
        pages.extend(pack_pages(b, layout, algorithm, limits, split)?);
        return Some(pages);
    }
    pack_downscaled(items, layout, algorithm, limits).map(|p| vec![p])
}

/// Halve every content size until the page fits.
pub fn pack_downscaled(
    items: &[PackItem],
    layout: Layout,
    algorithm: PackingAlgorithm,
    limits: &PackLimits,
) -> Option<PackedPage> {
    for downscale in 1..=16u32 {
        let scaled: Vec<PackItem> = items
            .iter()
            .map(|it| PackItem {
                key: it.key,
                width: (it.width >> downscale).max(1),
                height: (it.height >> downscale).max(1),
            })
            .collect();
        if let Some(mut page) = pack(&scaled, layout, algorithm, limits) {
            warn!(
                entries = items.len(),
                factor = 1u32 << downscale,
                "Atlas entries downscaled to fit the maximum atlas size"
            );
            page.downscale = downscale;
            return Some(page);
        }
    }
    None
}

/// Grow the page from the largest entry until everything fits.
fn pack_free(items: &[PackItem], limits: &PackLimits, place: PlaceFn) -> Option<PackedPage> {
    let pad = limits.padding;
    // Sort by max padded dimension descending
    let mut order: Vec<PackItem> = items.to_vec();
    order.sort_by(|a, b| {
        let ma = (a.width + pad * 2).max(a.height + pad * 2);
        let mb = (b.width + pad * 2).max(b.height + pad * 2);
        mb.cmp(&ma).then(a.key.cmp(&b.key))
    });

    let first = order[0];
    let floor = if limits.power_of_two { 64 } else { 1 };
    let mut atlas_w = limits.snap((first.width + pad * 2).max(floor), limits.width_limit());
    let mut atlas_h = limits.snap((first.height + pad * 2).max(floor), limits.height_limit());

    loop {
        if let Some(placements) = place(&order, atlas_w, atlas_h, pad) {
            return Some(tighten(placements, limits));
        }
        // Grow: double the smaller dimension
        if atlas_w <= atlas_h && atlas_w < limits.width_limit() {
            atlas_w = (atlas_w * 2).min(limits.width_limit());
        } else if atlas_h < limits.height_limit() {
            atlas_h = (atlas_h * 2).min(limits.height_limit());
        } else if atlas_w < limits.width_limit() {
            atlas_w = (atlas_w * 2).min(limits.width_limit());
        } else {
            return None;
        }
    }
}

/// Shrink the page to the used area, keeping the power-of-two policy.
fn tighten(placements: Vec<Placement>, limits: &PackLimits) -> PackedPage {
    let pad = limits.padding;
    let mut max_x = 0u32;
    let mut max_y = 0u32;
    for p in &placements {
        max_x = max_x.max(p.x + p.width + pad);
        max_y = max_y.max(p.y + p.height + pad);
    }
    PackedPage {
        width: limits.snap(max_x, limits.width_limit()),
        height: limits.snap(max_y, limits.height_limit()),
        placements,
        downscale: 0,
    }
}

fn place_guillotine(order: &[PackItem], atlas_w: u32, atlas_h: u32, pad: u32) -> Option<Vec<Placement>> {
    let mut free_rects = vec![FreeRect {
        x: 0,
        y: 0,
        w: atlas_w,
        h: atlas_h,
    }];

    let mut placements = Vec::with_capacity(order.len());

    for item in order {
        let total_w = item.width + pad * 2;
        let total_h = item.height + pad * 2;

        let best = find_bssf(&free_rects, total_w, total_h)?;
        let rect = free_rects.remove(best);

        placements.push(Placement {
            key: item.key,
            x: rect.x + pad,
            y: rect.y + pad,
            width: item.width,
            height: item.height,
        });

        guillotine_split(&mut free_rects, &rect, total_w, total_h);
    }

    Some(placements)
}

/// Best Short Side Fit: the free rect leaving the smallest leftover side.
fn find_bssf(free_rects: &[FreeRect], w: u32, h: u32) -> Option<usize> {
    let mut best_idx = None;
    let mut best_short_side = u32::MAX;

    for (i, rect) in free_rects.iter().enumerate() {
        if rect.w >= w && rect.h >= h {
            let short_side = (rect.w - w).min(rect.h - h);
            if short_side < best_short_side {
                best_short_side = short_side;
                best_idx = Some(i);
            }
        }
    }

    best_idx
}

fn guillotine_split(free_rects: &mut Vec<FreeRect>, rect: &FreeRect, w: u32, h: u32) {
    let right_w = rect.w - w;
    let below_h = rect.h - h;

    if right_w > 0 {
        free_rects.push(FreeRect {
            x: rect.x + w,
            y: rect.y,
            w: right_w,
            h,
        });
    }

    if below_h > 0 {
        free_rects.push(FreeRect {
            x: rect.x,
            y: rect.y + h,
            w: rect.w,
            h: below_h,
        });
    }
}

/// Row-by-row shelf placement, tallest entries first.
fn place_shelves(order: &[PackItem], atlas_w: u32, atlas_h: u32, pad: u32) -> Option<Vec<Placement>> {
    let mut by_height: Vec<&PackItem> = order.iter().collect();
    by_height.sort_by(|a, b| b.height.cmp(&a.height).then(a.key.cmp(&b.key)));

    let mut placements = Vec::with_capacity(order.len());
    let (mut cursor_x, mut shelf_y, mut shelf_h) = (0u32, 0u32, 0u32);

    for item in by_height {
        let total_w = item.width + pad * 2;
        let total_h = item.height + pad * 2;
        if total_w > atlas_w {
            return None;
        }
        if cursor_x + total_w > atlas_w {
            shelf_y += shelf_h;
            cursor_x = 0;
            shelf_h = 0;
        }
        if shelf_y + total_h > atlas_h {
            return None;
        }
        placements.push(Placement {
            key: item.key,
            x: cursor_x + pad,
            y: shelf_y + pad,
            width: item.width,
            height: item.height,
        });
        cursor_x += total_w;
        shelf_h = shelf_h.max(total_h);
    }
    Some(placements)
}

/// Stack full-span entries. Padding applies only across the stacking axis so
/// the wrapping axis meets the page edges.
fn pack_stacked(items: &[PackItem], limits: &PackLimits, columns: bool) -> Option<PackedPage> {
    let pad = limits.padding;
    let (span_max, stack_max) = if columns {
        (limits.height_limit(), limits.width_limit())
    } else {
        (limits.width_limit(), limits.height_limit())
    };
    let widest = items
        .iter()
        .map(|it| if columns { it.height } else { it.width })
        .max()
        .unwrap_or(1);
    let span = limits.snap(widest, span_max);

    let mut cursor = 0u32;
    let mut placements = Vec::with_capacity(items.len());
    for item in items {
        let depth = if columns { item.width } else { item.height };
        let offset = cursor + pad;
        cursor += depth + pad * 2;
        if cursor > stack_max {
            return None;
        }
        placements.push(if columns {
            Placement {
                key: item.key,
                x: offset,
                y: 0,
                width: depth,
                height: span,
            }
        } else {
            Placement {
                key: item.key,
                x: 0,
                y: offset,
                width: span,
                height: depth,
            }
        });
    }
    let stack = limits.snap(cursor, stack_max);
    let (width, height) = if columns { (stack, span) } else { (span, stack) };
    Some(PackedPage {
        width,
        height,
        placements,
        downscale: 0,
    })
}

fn pack_whole(items: &[PackItem], limits: &PackLimits) -> Option<PackedPage> {
    let [item] = items else {
        return None;
    };
    let width = limits.snap(item.width, limits.width_limit());
    let height = limits.snap(item.height, limits.height_limit());
    Some(PackedPage {
        width,
        height,
        placements: vec![Placement {
            key: item.key,
            x: 0,
            y: 0,
            width,
            height,
        }],
        downscale: 0,
    })
}
