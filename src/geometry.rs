//! Coordinate, box and mask transforms between the client, the session image
//! and the model boundary.
//!
//! Every function here is pure: inputs are borrowed and a new value is
//! returned.

use image::{Rgb, RgbImage};
use tracing::debug;

use crate::error::{EditError, Result};
use crate::types::{BBox, CenterBox, Mask};

fn check_extent(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(EditError::invalid(format!(
            "image extent must be non-zero, got {}x{}",
            width, height
        )));
    }
    Ok(())
}

/// Pixel coordinates -> [0, 1] relative to the image extent.
pub fn normalize_point(x: f32, y: f32, width: u32, height: u32) -> Result<(f32, f32)> {
    check_extent(width, height)?;
    Ok((x / width as f32, y / height as f32))
}

/// [0, 1] coordinates -> pixel coordinates.
pub fn denormalize_point(nx: f32, ny: f32, width: u32, height: u32) -> Result<(f32, f32)> {
    check_extent(width, height)?;
    Ok((nx * width as f32, ny * height as f32))
}

pub fn center_to_corner(b: &CenterBox) -> BBox {
    let x1 = b.cx - b.w / 2.0;
    let y1 = b.cy - b.h / 2.0;
    BBox {
        x1,
        y1,
        x2: x1 + b.w,
        y2: y1 + b.h,
    }
}

pub fn corner_to_center(b: &BBox) -> CenterBox {
    let w = b.width();
    let h = b.height();
    CenterBox {
        cx: b.x1 + w / 2.0,
        cy: b.y1 + h / 2.0,
        w,
        h,
    }
}

/// Batch form of [`center_to_corner`].
pub fn centers_to_corners(boxes: &[CenterBox]) -> Vec<BBox> {
    boxes.iter().map(center_to_corner).collect()
}

/// Scale a mask by `k` about the image center, keeping the original extent.
///
/// `k >= 1` grows the mask and crops the overflow; `k < 1` shrinks it onto an
/// empty canvas. Each output pixel samples its nearest source pixel, so no
/// buffer larger than the mask is ever allocated.
pub fn rescale_mask_about_center(mask: &Mask, k: f32) -> Result<Mask> {
    if !(k.is_finite() && k > 0.0) {
        return Err(EditError::invalid(format!(
            "mask rescale factor must be positive, got {}",
            k
        )));
    }

    let (width, height) = mask.dimensions();
    let k = k as f64;
    let new_w = ((width as f64 * k).round() as u64).max(1);
    let new_h = ((height as f64 * k).round() as u64).max(1);
    if (new_w, new_h) == (width as u64, height as u64) {
        return Ok(mask.clone());
    }

    debug!(
        "Rescaling mask {}x{} by {} -> {}x{}",
        width, height, k, new_w, new_h
    );
    let (cx, cy) = (width as f64 / 2.0, height as f64 / 2.0);
    let source = |v: u32, center: f64, extent: u32| -> Option<u32> {
        let s = ((v as f64 + 0.5 - center) / k + center).floor();
        (s >= 0.0 && s < extent as f64).then_some(s as u32)
    };
    Ok(Mask::from_fn(width, height, |x, y| {
        match (source(x, cx, width), source(y, cy, height)) {
            (Some(sx), Some(sy)) => mask.get(sx, sy),
            _ => false,
        }
    }))
}

/// 0 -> black, 1 -> white, replicated across three channels.
pub fn binary_mask_to_image(mask: &Mask) -> RgbImage {
    let (width, height) = mask.dimensions();
    RgbImage::from_fn(width, height, |x, y| {
        if mask.get(x, y) {
            Rgb([255, 255, 255])
        } else {
            Rgb([0, 0, 0])
        }
    })
}

/// Blend `tint` into `image` under each mask, one mask after another.
///
/// Later masks blend over the result of earlier ones, so overlapping regions
/// accumulate tint.
pub fn alpha_composite_masks(
    image: &RgbImage,
    masks: &[Mask],
    alphas: &[f32],
    tint: Rgb<u8>,
) -> Result<RgbImage> {
    if masks.len() != alphas.len() {
        return Err(EditError::invalid(format!(
            "got {} alphas for {} masks",
            alphas.len(),
            masks.len()
        )));
    }
    if let Some(bad) = alphas.iter().find(|a| !(0.0..=1.0).contains(*a)) {
        return Err(EditError::invalid(format!(
            "alpha must be in [0, 1], got {}",
            bad
        )));
    }
    for mask in masks {
        if mask.dimensions() != image.dimensions() {
            return Err(EditError::DimensionMismatch {
                expected: image.dimensions(),
                actual: mask.dimensions(),
            });
        }
    }

    let mut out = image.clone();
    for (mask, &alpha) in masks.iter().zip(alphas) {
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            if !mask.get(x, y) {
                continue;
            }
            for c in 0..3 {
                let blended = (1.0 - alpha) * pixel[c] as f32 + alpha * tint[c] as f32;
                pixel[c] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    Ok(out)
}

/// Index of the maximum score, first-seen on ties. NaN scores never win.
pub fn stable_argmax(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &s) in scores.iter().enumerate() {
        if s.is_nan() {
            continue;
        }
        match best {
            Some((_, v)) if s <= v => {}
            _ => best = Some((i, s)),
        }
    }
    best.map(|(i, _)| i)
}
