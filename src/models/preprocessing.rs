//! Image preparation around the generative model: working-resolution
//! letterboxing, mask conditioning, edge maps and colour matching.

use std::io::Cursor;

use anyhow::{Context, Result};
use image::{imageops, imageops::FilterType, GrayImage, ImageFormat, Rgb, RgbImage};
use ndarray::{ArrayView3, Axis};
use tracing::debug;

use crate::types::Mask;

/// Phrases appended to every generation prompt.
pub const QUALITY_ENHANCEMENTS: [&str; 4] = [
    "high quality",
    "detailed",
    "realistic",
    "seamless integration",
];

/// Canny hysteresis thresholds for the control image.
pub const CANNY_LOW: f32 = 100.0;
pub const CANNY_HIGH: f32 = 200.0;

/// Where a `width x height` image lands inside a `target` square.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Letterbox {
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub left: u32,
    pub top: u32,
}

impl Letterbox {
    pub fn fit(width: u32, height: u32, target: u32) -> Self {
        let ratio = target as f64 / width.max(height).max(1) as f64;
        let scaled_width = ((width as f64 * ratio) as u32).clamp(1, target);
        let scaled_height = ((height as f64 * ratio) as u32).clamp(1, target);
        Self {
            scaled_width,
            scaled_height,
            left: (target - scaled_width) / 2,
            top: (target - scaled_height) / 2,
        }
    }
}

/// Scale the long side to `target` and pad the short side with black.
pub fn letterbox_image(image: &RgbImage, target: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let lb = Letterbox::fit(width, height, target);
    debug!(
        "Letterboxing image {}x{} -> {}x{} in {}x{}",
        width, height, lb.scaled_width, lb.scaled_height, target, target
    );
    let resized = imageops::resize(image, lb.scaled_width, lb.scaled_height, FilterType::Lanczos3);
    let mut canvas = RgbImage::new(target, target);
    imageops::overlay(&mut canvas, &resized, lb.left as i64, lb.top as i64);
    canvas
}

/// Letterbox a mask with the same geometry as its image and re-binarize it
/// at the 50% grey level.
pub fn letterbox_mask(mask: &GrayImage, target: u32) -> Mask {
    let (width, height) = mask.dimensions();
    let lb = Letterbox::fit(width, height, target);
    let resized = imageops::resize(mask, lb.scaled_width, lb.scaled_height, FilterType::Nearest);
    let mut canvas = GrayImage::new(target, target);
    imageops::overlay(&mut canvas, &resized, lb.left as i64, lb.top as i64);
    Mask::from_gray(&canvas, 127)
}

/// Crop the letterbox back out of a square result and resize to `original`.
pub fn restore_original_size(image: &RgbImage, original: (u32, u32)) -> RgbImage {
    let target = image.width().min(image.height());
    let lb = Letterbox::fit(original.0, original.1, target);
    let cropped =
        imageops::crop_imm(image, lb.left, lb.top, lb.scaled_width, lb.scaled_height).to_image();
    if cropped.dimensions() == original {
        return cropped;
    }
    imageops::resize(&cropped, original.0, original.1, FilterType::Lanczos3)
}

/// Soften mask edges. `sigma` must be positive.
pub fn blur_mask(mask: &GrayImage, sigma: f32) -> GrayImage {
    imageproc::filter::gaussian_blur_f32(mask, sigma)
}

/// Canny edge map of `image`, replicated to three channels.
pub fn make_edge_condition(image: &RgbImage) -> RgbImage {
    let gray = imageops::grayscale(image);
    let edges = imageproc::edges::canny(&gray, CANNY_LOW, CANNY_HIGH);
    RgbImage::from_fn(edges.width(), edges.height(), |x, y| {
        let v = edges.get_pixel(x, y)[0];
        Rgb([v, v, v])
    })
}

pub fn enhance_prompt(prompt: &str) -> String {
    format!("{}, {}", prompt, QUALITY_ENHANCEMENTS.join(", "))
}

/// Per-channel (mean, sample std) over values normalised to [0, 1].
pub fn channel_statistics(image: &RgbImage) -> Result<[(f32, f32); 3]> {
    let (width, height) = image.dimensions();
    let view = ArrayView3::from_shape((height as usize, width as usize, 3), image.as_raw())
        .context("image buffer does not match its dimensions")?;
    let pixels = view.mapv(|v| v as f32 / 255.0);

    let mut stats = [(0.0, 0.0); 3];
    for (c, slot) in stats.iter_mut().enumerate() {
        let channel = pixels.index_axis(Axis(2), c);
        let mean = channel.mean().unwrap_or(0.0);
        let std = if channel.len() > 1 { channel.std(1.0) } else { 0.0 };
        *slot = (mean, std);
    }
    Ok(stats)
}

/// Shift and scale each channel of `candidate` so its mean and standard
/// deviation match `reference`.
pub fn match_color_distribution(candidate: &RgbImage, reference: &RgbImage) -> Result<RgbImage> {
    let source = channel_statistics(candidate)?;
    let target = channel_statistics(reference)?;
    debug!("Colour matching {:?} -> {:?}", source, target);

    let mut out = candidate.clone();
    for pixel in out.pixels_mut() {
        for c in 0..3 {
            let (mean_s, std_s) = source[c];
            let (mean_t, std_t) = target[c];
            let x = pixel[c] as f32 / 255.0;
            let matched = if std_s > f32::EPSILON {
                (x - mean_s) / std_s * std_t + mean_t
            } else {
                x - mean_s + mean_t
            };
            pixel[c] = (matched.clamp(0.0, 1.0) * 255.0).round() as u8;
        }
    }
    Ok(out)
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("Failed to encode PNG")?;
    Ok(bytes)
}

pub fn encode_gray_png(image: &GrayImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("Failed to encode PNG")?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn create_test_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |_x, _y| Rgb([255u8, 0u8, 0u8]))
    }

    #[test]
    fn test_letterbox_geometry_landscape() {
        let lb = Letterbox::fit(200, 100, 1024);
        assert_eq!((lb.scaled_width, lb.scaled_height), (1024, 512));
        assert_eq!((lb.left, lb.top), (0, 256));
    }

    #[test]
    fn test_letterbox_image_pads_black() {
        let img = create_test_image(200, 100);
        let out = letterbox_image(&img, 64);
        assert_eq!(out.dimensions(), (64, 64));
        assert_eq!(out.get_pixel(32, 0), &Rgb([0, 0, 0]));
        assert_eq!(out.get_pixel(32, 32)[2], 0);
        assert!(out.get_pixel(32, 32)[0] > 200);
    }

    #[test]
    fn test_letterbox_mask_stays_aligned() {
        // Right half of a 200x100 mask.
        let mask = GrayImage::from_fn(200, 100, |x, _| Luma([if x >= 100 { 255 } else { 0 }]));
        let out = letterbox_mask(&mask, 64);
        assert_eq!(out.dimensions(), (64, 64));
        // Content band is rows 16..48.
        assert!(!out.get(10, 32));
        assert!(out.get(50, 32));
        assert!(!out.get(50, 5));
        assert_eq!(out.bbox().unwrap().to_array(), [32.0, 16.0, 64.0, 48.0]);
    }

    #[test]
    fn test_letterbox_mask_rebinarizes() {
        let mask = GrayImage::from_fn(10, 10, |x, _| Luma([if x < 5 { 100 } else { 200 }]));
        let out = letterbox_mask(&mask, 64);
        assert!(!out.get(10, 10));
        assert!(out.get(50, 10));
    }

    #[test]
    fn test_restore_original_size() {
        let img = create_test_image(200, 100);
        let square = letterbox_image(&img, 64);
        let restored = restore_original_size(&square, (200, 100));
        assert_eq!(restored.dimensions(), (200, 100));
        assert!(restored.get_pixel(100, 0)[0] > 200);
    }

    #[test]
    fn test_edge_condition_is_three_channel_and_binary() {
        let img = RgbImage::from_fn(32, 32, |x, _| {
            if x < 16 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let edges = make_edge_condition(&img);
        assert_eq!(edges.dimensions(), (32, 32));
        assert!(edges
            .pixels()
            .all(|p| p[0] == p[1] && p[1] == p[2] && (p[0] == 0 || p[0] == 255)));
        assert!(edges.pixels().any(|p| p[0] == 255));
    }

    #[test]
    fn test_enhance_prompt() {
        assert_eq!(
            enhance_prompt("a red car"),
            "a red car, high quality, detailed, realistic, seamless integration"
        );
    }

    #[test]
    fn test_blur_mask_softens_edges() {
        let mask = GrayImage::from_fn(20, 20, |x, _| Luma([if x < 10 { 0 } else { 255 }]));
        let blurred = blur_mask(&mask, 2.0);
        let edge = blurred.get_pixel(10, 10)[0];
        assert!(edge > 0 && edge < 255);
    }

    #[test]
    fn test_channel_statistics() {
        let img = RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                Rgb([0, 255, 51])
            } else {
                Rgb([255, 255, 51])
            }
        });
        let stats = channel_statistics(&img).unwrap();
        assert!((stats[0].0 - 0.5).abs() < 1e-6);
        // Sample std of {0, 1}
        assert!((stats[0].1 - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-5);
        assert!((stats[1].0 - 1.0).abs() < 1e-6);
        assert!(stats[1].1.abs() < 1e-6);
    }

    #[test]
    fn test_match_color_distribution_moves_to_reference() {
        let candidate = RgbImage::from_fn(8, 8, |x, y| Rgb([(x * 20) as u8, (y * 20) as u8, 100]));
        let reference = RgbImage::from_fn(8, 8, |x, y| Rgb([(x * 10 + 100) as u8, (y * 5) as u8, 30]));
        let matched = match_color_distribution(&candidate, &reference).unwrap();
        let got = channel_statistics(&matched).unwrap();
        let want = channel_statistics(&reference).unwrap();
        for c in 0..3 {
            assert!((got[c].0 - want[c].0).abs() < 0.01, "channel {}", c);
        }
        assert!((got[0].1 - want[0].1).abs() < 0.01);
    }

    #[test]
    fn test_png_encoding() {
        let bytes = encode_png(&create_test_image(4, 4)).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), 4);
        let gray = encode_gray_png(&GrayImage::new(3, 2)).unwrap();
        assert_eq!(image::load_from_memory(&gray).unwrap().height(), 2);
    }
}
