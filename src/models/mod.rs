//! Capability interfaces for the pretrained models.
//!
//! Each model family sits behind a narrow synchronous trait. Implementations
//! block while they run; orchestrators call them through
//! [`crate::worker::InferenceRunner`] so the request path never waits on
//! them directly.

pub mod preprocessing;
pub mod remote;

use image::{GrayImage, RgbImage};
use ndarray::Array2;

use crate::config::DetectionThresholds;
use crate::types::{BBox, DetectionSet, Mask, PointLabel};

pub use preprocessing::{
    enhance_prompt, letterbox_image, letterbox_mask, make_edge_condition,
    match_color_distribution,
};
pub use remote::{RemoteDetector, RemoteGenerator, RemoteScorer, RemoteSegmenter};

/// Click prompt in pixel coordinates of the staged image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelPoint {
    pub x: f32,
    pub y: f32,
    pub label: PointLabel,
}

/// Prompt as the segmentation model consumes it, in pixel space.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentationPrompt {
    Points(Vec<PixelPoint>),
    /// Corner-form boxes, one mask expected per box.
    Boxes(Vec<BBox>),
}

/// Masks with their quality scores and low-resolution logits, aligned by index.
#[derive(Debug, Clone, Default)]
pub struct SegmentationOutput {
    pub masks: Vec<Mask>,
    pub scores: Vec<f32>,
    pub logits: Vec<Array2<f32>>,
}

pub trait SegmentationBackend: Send + Sync {
    fn predict(
        &self,
        image: &RgbImage,
        prompt: &SegmentationPrompt,
        multimask_output: bool,
    ) -> anyhow::Result<SegmentationOutput>;
}

pub trait DetectionBackend: Send + Sync {
    /// Detections above the thresholds, in the detector's own order.
    fn detect(
        &self,
        image: &RgbImage,
        caption: &str,
        thresholds: &DetectionThresholds,
    ) -> anyhow::Result<DetectionSet>;
}

/// One conditioned generation call at working resolution.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub image: &'a RgbImage,
    /// 0/255 mask, white where content is regenerated.
    pub mask: &'a GrayImage,
    pub control_image: &'a RgbImage,
    pub prompt: &'a str,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub controlnet_conditioning_scale: f32,
    pub eta: f32,
    pub seed: u64,
}

pub trait GenerativeInpaintBackend: Send + Sync {
    fn generate(&self, request: &GenerationRequest<'_>) -> anyhow::Result<RgbImage>;
}

/// Image-text similarity, higher is better.
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, image: &RgbImage, text: &str) -> anyhow::Result<f32>;
}
