//! Pixel work for atlas pages: decoding sources, sampling them into
//! placements, edge bleed and final encoding.

use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgba, RgbaImage};
use tracing::warn;

use crate::config::AtlasFormat;
use crate::error::{BakeError, Result};
use crate::types::{Material, Rect, TextureData};

use super::packer::Placement;

/// Decode a TextureData into an RgbaImage.
///
/// Tries encoded image formats first, falls back to raw RGBA/RGB interpretation.
pub fn decode_texture(tex: &TextureData) -> Result<RgbaImage> {
    if let Ok(img) = image::load_from_memory(&tex.data) {
        let img = img.to_rgba8();
        if img.width() > 0 && img.height() > 0 {
            return Ok(img);
        }
    }

    if tex.width == 0 || tex.height == 0 {
        warn!(width = tex.width, height = tex.height, "Texture has no pixels");
        return Err(BakeError::Texture(format!(
            "empty {}x{} texture ({})",
            tex.width, tex.height, tex.mime_type
        )));
    }

    let pixel_count = (tex.width as usize) * (tex.height as usize);

    if tex.data.len() == pixel_count * 4 {
        if let Some(img) = RgbaImage::from_raw(tex.width, tex.height, tex.data.clone()) {
            return Ok(img);
        }
    }

    if tex.data.len() == pixel_count * 3 {
        let mut rgba = Vec::with_capacity(pixel_count * 4);
        for chunk in tex.data.chunks_exact(3) {
            rgba.extend_from_slice(chunk);
            rgba.push(255);
        }
        if let Some(img) = RgbaImage::from_raw(tex.width, tex.height, rgba) {
            return Ok(img);
        }
    }

    warn!(
        width = tex.width,
        height = tex.height,
        data_len = tex.data.len(),
        "Cannot decode texture data"
    );
    Err(BakeError::Texture(format!(
        "cannot decode {}x{} texture ({} bytes, {})",
        tex.width,
        tex.height,
        tex.data.len(),
        tex.mime_type
    )))
}

/// Whether a texture property holds tangent-space normals.
pub fn is_normal_property(property: &str) -> bool {
    let p = property.to_ascii_lowercase();
    p.contains("bump") || p.contains("normal")
}

/// Fill color used when `material` has no image for `property`.
pub fn placeholder_color(material: &Material, property: &str) -> Rgba<u8> {
    if is_normal_property(property) {
        // Flat tangent-space normal
        return Rgba([128, 128, 255, 255]);
    }
    let c = material.base_color();
    Rgba(c.map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8))
}

/// A solid image standing in for a missing texture.
pub fn placeholder(color: Rgba<u8>, size: u32) -> RgbaImage {
    RgbaImage::from_pixel(size.max(1), size.max(1), color)
}

/// Source pixel for a normalized coordinate, wrapping outside `[0, 1)`.
fn sample_wrapped(source: &RgbaImage, u: f64, v: f64) -> Rgba<u8> {
    let (w, h) = source.dimensions();
    let su = (u.rem_euclid(1.0) * w as f64) as u32 % w;
    let sv = (v.rem_euclid(1.0) * h as f64) as u32 % h;
    *source.get_pixel(su, sv)
}

/// Copy the `sampling` region of `source` into `placement`, nearest-neighbour.
pub fn blit_sampled(atlas: &mut RgbaImage, source: &RgbaImage, sampling: &Rect, placement: &Placement) {
    let (atlas_w, atlas_h) = atlas.dimensions();
    for py in 0..placement.height {
        let v = sampling.y + (py as f64 + 0.5) / placement.height as f64 * sampling.height;
        for px in 0..placement.width {
            let u = sampling.x + (px as f64 + 0.5) / placement.width as f64 * sampling.width;
            let ax = placement.x + px;
            let ay = placement.y + py;
            if ax < atlas_w && ay < atlas_h {
                atlas.put_pixel(ax, ay, sample_wrapped(source, u, v));
            }
        }
    }
}

/// Composite `source` into `placement` by resampling through a layer.
///
/// The sampled region is captured at source resolution first, then scaled
/// with a triangle filter and laid over the page.
pub fn blit_scaled(atlas: &mut RgbaImage, source: &RgbaImage, sampling: &Rect, placement: &Placement) {
    let layer = if sampling.approx_eq(&Rect::UNIT) {
        source.clone()
    } else {
        let (w, h) = source.dimensions();
        let cap_w = ((w as f64 * sampling.width).ceil() as u32).max(1);
        let cap_h = ((h as f64 * sampling.height).ceil() as u32).max(1);
        let mut capture = RgbaImage::new(cap_w, cap_h);
        let full = Placement {
            key: placement.key,
            x: 0,
            y: 0,
            width: cap_w,
            height: cap_h,
        };
        blit_sampled(&mut capture, source, sampling, &full);
        capture
    };
    let resized = imageops::resize(&layer, placement.width, placement.height, FilterType::Triangle);
    imageops::replace(atlas, &resized, placement.x as i64, placement.y as i64);
}

/// Replicate edge pixels into the padding region for bleed.
pub fn fill_bleed(atlas: &mut RgbaImage, placement: &Placement, pad: u32) {
    let (atlas_w, atlas_h) = atlas.dimensions();
    let inner_x = placement.x;
    let inner_y = placement.y;
    let inner_w = placement.width;
    let inner_h = placement.height;

    if inner_w == 0 || inner_h == 0 || pad == 0 {
        return;
    }

    // Top and bottom bleed
    for px in 0..inner_w {
        let ax = inner_x + px;
        if ax >= atlas_w {
            break;
        }
        let top_pixel = *atlas.get_pixel(ax, inner_y.min(atlas_h - 1));
        let bot_pixel = *atlas.get_pixel(ax, (inner_y + inner_h - 1).min(atlas_h - 1));

        for p in 1..=pad {
            if inner_y >= p {
                atlas.put_pixel(ax, inner_y - p, top_pixel);
            }
            let ay = inner_y + inner_h - 1 + p;
            if ay < atlas_h {
                atlas.put_pixel(ax, ay, bot_pixel);
            }
        }
    }

    // Left and right bleed, corners included
    let y_start = inner_y.saturating_sub(pad);
    let y_end = (inner_y + inner_h + pad).min(atlas_h);
    for ay in y_start..y_end {
        let left_pixel = *atlas.get_pixel(inner_x.min(atlas_w - 1), ay);
        let right_pixel = *atlas.get_pixel((inner_x + inner_w - 1).min(atlas_w - 1), ay);

        for p in 1..=pad {
            if inner_x >= p {
                atlas.put_pixel(inner_x - p, ay, left_pixel);
            }
            let ax = inner_x + inner_w - 1 + p;
            if ax < atlas_w {
                atlas.put_pixel(ax, ay, right_pixel);
            }
        }
    }
}

/// Encode an atlas page for output.
pub fn encode(image: &RgbaImage, format: AtlasFormat) -> Result<TextureData> {
    let (width, height) = image.dimensions();
    let (image_format, mime_type) = match format {
        AtlasFormat::Png => (ImageFormat::Png, "image/png"),
        AtlasFormat::WebP => (ImageFormat::WebP, "image/webp"),
    };
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, image_format)
        .map_err(|e| BakeError::Texture(format!("{format} encoding failed: {e}")))?;
    Ok(TextureData {
        data: buf.into_inner(),
        mime_type: mime_type.into(),
        width,
        height,
    })
}

/// File extension for an atlas format.
pub fn extension(format: AtlasFormat) -> &'static str {
    match format {
        AtlasFormat::Png => "png",
        AtlasFormat::WebP => "webp",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard(size: u32) -> RgbaImage {
        RgbaImage::from_fn(size, size, |x, y| {
            if (x + y) % 2 == 0 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 255, 255])
            }
        })
    }

    fn quadrants() -> RgbaImage {
        RgbaImage::from_fn(4, 4, |x, y| match (x < 2, y < 2) {
            (true, true) => Rgba([255, 0, 0, 255]),
            (false, true) => Rgba([0, 255, 0, 255]),
            (true, false) => Rgba([0, 0, 255, 255]),
            (false, false) => Rgba([255, 255, 255, 255]),
        })
    }

    fn placement(x: u32, y: u32, width: u32, height: u32) -> Placement {
        Placement {
            key: 0,
            x,
            y,
            width,
            height,
        }
    }

    #[test]
    fn decode_png_and_raw() {
        let img = checkerboard(4);
        let td = encode(&img, AtlasFormat::Png).unwrap();
        assert_eq!(td.mime_type, "image/png");
        let decoded = decode_texture(&td).unwrap();
        assert_eq!(decoded.get_pixel(0, 0), &Rgba([255, 0, 0, 255]));

        let raw = TextureData {
            data: vec![10, 20, 30, 255],
            mime_type: "image/raw".into(),
            width: 1,
            height: 1,
        };
        assert_eq!(decode_texture(&raw).unwrap().get_pixel(0, 0), &Rgba([10, 20, 30, 255]));

        let rgb = TextureData {
            data: vec![10, 20, 30, 40, 50, 60],
            mime_type: "image/raw".into(),
            width: 2,
            height: 1,
        };
        assert_eq!(decode_texture(&rgb).unwrap().get_pixel(1, 0), &Rgba([40, 50, 60, 255]));
    }

    #[test]
    fn undecodable_texture_is_an_error() {
        let bad = TextureData {
            data: vec![1, 2, 3],
            mime_type: "image/png".into(),
            width: 8,
            height: 8,
        };
        assert!(matches!(decode_texture(&bad), Err(BakeError::Texture(_))));
    }

    #[test]
    fn empty_texture_is_an_error() {
        let empty = TextureData {
            data: Vec::new(),
            mime_type: "image/raw".into(),
            width: 0,
            height: 0,
        };
        assert!(matches!(decode_texture(&empty), Err(BakeError::Texture(_))));

        let flat = TextureData {
            data: Vec::new(),
            mime_type: "image/raw".into(),
            width: 16,
            height: 0,
        };
        assert!(decode_texture(&flat).is_err());
    }

    #[test]
    fn placeholder_colors() {
        let mut mat = Material::default();
        mat.colors.insert("_Color".into(), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(placeholder_color(&mat, "_MainTex"), Rgba([255, 0, 0, 255]));
        assert_eq!(placeholder_color(&mat, "_BumpMap"), Rgba([128, 128, 255, 255]));
        let img = placeholder(Rgba([1, 2, 3, 4]), 16);
        assert_eq!(img.dimensions(), (16, 16));
    }

    #[test]
    fn sampled_blit_copies_subregion() {
        let src = quadrants();
        let mut atlas = RgbaImage::new(8, 8);
        // Top-right quadrant of the source
        blit_sampled(&mut atlas, &src, &Rect::new(0.5, 0.0, 0.5, 0.5), &placement(2, 2, 2, 2));
        assert_eq!(atlas.get_pixel(2, 2), &Rgba([0, 255, 0, 255]));
        assert_eq!(atlas.get_pixel(3, 3), &Rgba([0, 255, 0, 255]));
        assert_eq!(atlas.get_pixel(0, 0), &Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn sampled_blit_wraps() {
        let src = quadrants();
        let mut atlas = RgbaImage::new(4, 2);
        // Two periods horizontally
        blit_sampled(&mut atlas, &src, &Rect::new(0.0, 0.0, 2.0, 0.5), &placement(0, 0, 4, 1));
        assert_eq!(atlas.get_pixel(0, 0), atlas.get_pixel(2, 0));
        assert_eq!(atlas.get_pixel(1, 0), atlas.get_pixel(3, 0));
    }

    #[test]
    fn bleed_replicates_edges() {
        let mut atlas = RgbaImage::new(8, 8);
        let p = placement(2, 2, 4, 4);
        blit_sampled(&mut atlas, &quadrants(), &Rect::UNIT, &p);
        fill_bleed(&mut atlas, &p, 2);
        assert_eq!(atlas.get_pixel(0, 0), atlas.get_pixel(2, 2));
        assert_eq!(atlas.get_pixel(7, 7), atlas.get_pixel(5, 5));
        assert_eq!(atlas.get_pixel(1, 4), atlas.get_pixel(2, 4));
    }

    #[test]
    fn scaled_blit_fills_placement() {
        let src = RgbaImage::from_pixel(16, 16, Rgba([9, 9, 9, 255]));
        let mut atlas = RgbaImage::new(8, 8);
        blit_scaled(&mut atlas, &src, &Rect::UNIT, &placement(4, 0, 4, 4));
        assert_eq!(atlas.get_pixel(4, 0), &Rgba([9, 9, 9, 255]));
        assert_eq!(atlas.get_pixel(7, 3), &Rgba([9, 9, 9, 255]));
        assert_eq!(atlas.get_pixel(3, 0), &Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn webp_encodes() {
        let td = encode(&checkerboard(8), AtlasFormat::WebP).unwrap();
        assert_eq!(td.mime_type, "image/webp");
        let decoded = image::load_from_memory(&td.data).unwrap().to_rgba8();
        assert_eq!(decoded.dimensions(), (8, 8));
        assert_eq!(extension(AtlasFormat::WebP), "webp");
    }
}
