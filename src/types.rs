//! Shared type definitions for sam-inpaint.

use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{EditError, Result};

/// Bounding box in format (x1, y1, x2, y2)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Scale both axes independently, e.g. normalized -> pixel space.
    pub fn scale(&self, sx: f32, sy: f32) -> BBox {
        BBox {
            x1: self.x1 * sx,
            y1: self.y1 * sy,
            x2: self.x2 * sx,
            y2: self.y2 * sy,
        }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// Bounding box in format (cx, cy, w, h)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CenterBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

impl CenterBox {
    pub fn to_array(&self) -> [f32; 4] {
        [self.cx, self.cy, self.w, self.h]
    }

    /// Reject boxes that leave the unit square or have negative extent.
    pub fn validate_normalized(&self) -> Result<()> {
        let in_unit = |v: f32| (0.0..=1.0).contains(&v);
        if !(in_unit(self.cx) && in_unit(self.cy) && in_unit(self.w) && in_unit(self.h)) {
            return Err(EditError::invalid(format!(
                "box {:?} must be normalized to [0, 1]",
                self.to_array()
            )));
        }
        Ok(())
    }
}

impl From<[f32; 4]> for CenterBox {
    fn from([cx, cy, w, h]: [f32; 4]) -> Self {
        CenterBox { cx, cy, w, h }
    }
}

/// Binary segmentation mask
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    data: Vec<bool>, // Flattened row-major format
}

impl Mask {
    /// Create a new mask, checking that the buffer covers `width * height`.
    pub fn new(width: u32, height: u32, data: Vec<bool>) -> Result<Self> {
        if data.len() != width as usize * height as usize {
            return Err(EditError::invalid(format!(
                "mask data has {} values, expected {}x{}",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// All-background mask
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![false; width as usize * height as usize],
        }
    }

    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> bool) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Binarize a grayscale raster: pixels strictly above `threshold` are foreground.
    pub fn from_gray(gray: &GrayImage, threshold: u8) -> Self {
        Self {
            width: gray.width(),
            height: gray.height(),
            data: gray.pixels().map(|p| p[0] > threshold).collect(),
        }
    }

    /// Parse a nested numeric array of shape (H, W) or (N, H, W).
    ///
    /// Values >= 0.5 are foreground. Stacked planes are unioned.
    pub fn from_nested(nested: &NestedMask) -> Result<Self> {
        match nested {
            NestedMask::Plane(rows) => plane_to_mask(rows),
            NestedMask::Stack(planes) => {
                let masks = planes
                    .iter()
                    .map(|p| plane_to_mask(p))
                    .collect::<Result<Vec<_>>>()?;
                Mask::union_all(&masks)?
                    .ok_or_else(|| EditError::invalid("mask stack is empty"))
            }
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Get mask value at (x, y)
    pub fn get(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.data[(y * self.width + x) as usize]
    }

    /// Get bounding box from mask
    pub fn bbox(&self) -> Option<BBox> {
        let mut min_x = self.width;
        let mut max_x = 0;
        let mut min_y = self.height;
        let mut max_y = 0;
        let mut found = false;

        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y) {
                    found = true;
                    min_x = min_x.min(x);
                    max_x = max_x.max(x);
                    min_y = min_y.min(y);
                    max_y = max_y.max(y);
                }
            }
        }

        if found {
            Some(BBox {
                x1: min_x as f32,
                y1: min_y as f32,
                x2: (max_x + 1) as f32,
                y2: (max_y + 1) as f32,
            })
        } else {
            None
        }
    }

    /// Get number of true pixels
    pub fn pixel_count(&self) -> usize {
        self.data.iter().filter(|&&b| b).count()
    }

    /// 0/255 single channel raster
    pub fn to_gray(&self) -> GrayImage {
        let raw = self.data.iter().map(|&b| if b { 255 } else { 0 }).collect();
        GrayImage::from_raw(self.width, self.height, raw)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }

    /// Rows of 0/1 values, the JSON shape clients send back for inpainting.
    pub fn to_nested(&self) -> Vec<Vec<u8>> {
        self.data
            .chunks(self.width.max(1) as usize)
            .map(|row| row.iter().map(|&b| b as u8).collect())
            .collect()
    }

    pub fn union(&self, other: &Mask) -> Result<Mask> {
        if self.dimensions() != other.dimensions() {
            return Err(EditError::DimensionMismatch {
                expected: self.dimensions(),
                actual: other.dimensions(),
            });
        }
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(&a, &b)| a || b)
            .collect();
        Mask::new(self.width, self.height, data)
    }

    /// Union of every mask, `None` for an empty slice.
    pub fn union_all(masks: &[Mask]) -> Result<Option<Mask>> {
        let mut iter = masks.iter();
        let Some(first) = iter.next() else {
            return Ok(None);
        };
        iter.try_fold(first.clone(), |acc, m| acc.union(m)).map(Some)
    }
}

fn plane_to_mask(rows: &[Vec<f32>]) -> Result<Mask> {
    let height = rows.len();
    let width = rows.first().map(Vec::len).unwrap_or(0);
    if height == 0 || width == 0 {
        return Err(EditError::invalid("mask must not be empty"));
    }
    let mut data = Vec::with_capacity(width * height);
    for (y, row) in rows.iter().enumerate() {
        if row.len() != width {
            return Err(EditError::invalid(format!(
                "mask row {} has {} values, expected {}",
                y,
                row.len(),
                width
            )));
        }
        data.extend(row.iter().map(|&v| v >= 0.5));
    }
    Mask::new(width as u32, height as u32, data)
}

/// Mask as it arrives over JSON: one plane or a stack of planes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NestedMask {
    Plane(Vec<Vec<f32>>),
    Stack(Vec<Vec<Vec<f32>>>),
}

/// Foreground/background flag attached to a click prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PointLabel {
    Background = 0,
    Foreground = 1,
}

impl TryFrom<u8> for PointLabel {
    type Error = EditError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PointLabel::Background),
            1 => Ok(PointLabel::Foreground),
            other => Err(EditError::invalid(format!(
                "point label must be 0 or 1, got {}",
                other
            ))),
        }
    }
}

impl From<PointLabel> for u8 {
    fn from(label: PointLabel) -> u8 {
        label as u8
    }
}

impl Default for PointLabel {
    fn default() -> Self {
        PointLabel::Foreground
    }
}

/// Everything a client can use to direct inference.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    /// Normalized click position.
    Point { x: f32, y: f32, label: PointLabel },
    /// Normalized center-form boxes.
    BoxSet(Vec<CenterBox>),
    Text { prompt: String, single_target: bool },
}

/// Open-vocabulary detections, aligned by index.
///
/// Boxes are normalized center-form as produced by the detector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionSet {
    pub boxes: Vec<CenterBox>,
    pub scores: Vec<f32>,
    pub phrases: Vec<String>,
}

impl DetectionSet {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn is_aligned(&self) -> bool {
        self.boxes.len() == self.scores.len() && self.phrases.len() == self.scores.len()
    }

    /// Keep only the detection at `index`.
    pub fn select(&self, index: usize) -> DetectionSet {
        match (
            self.boxes.get(index),
            self.scores.get(index),
            self.phrases.get(index),
        ) {
            (Some(b), Some(s), Some(p)) => DetectionSet {
                boxes: vec![*b],
                scores: vec![*s],
                phrases: vec![p.clone()],
            },
            _ => DetectionSet::default(),
        }
    }
}

/// Best inpainting candidate and how it was chosen.
#[derive(Debug, Clone)]
pub struct InpaintingResult {
    pub image: RgbImage,
    pub clip_score: f32,
    /// Seed the selected candidate was generated with.
    pub seed: u64,
    /// Score of every candidate, in generation order.
    pub candidate_scores: Vec<f32>,
}
