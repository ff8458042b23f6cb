//! Point and box prompted segmentation against a session image.

use std::sync::Arc;

use anyhow::anyhow;
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EditError, Result};
use crate::geometry::{alpha_composite_masks, centers_to_corners, denormalize_point};
use crate::models::{PixelPoint, SegmentationBackend, SegmentationPrompt};
use crate::session::SessionHandle;
use crate::types::{CenterBox, Mask, PointLabel};
use crate::worker::InferenceRunner;

/// Overlay colour used when rendering masks for the frontend.
pub const OVERLAY_TINT: Rgb<u8> = Rgb([30, 144, 255]);
pub const DEFAULT_OVERLAY_ALPHA: f32 = 0.6;

/// One opacity for every mask, or one per mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Alphas {
    Uniform(f32),
    PerMask(Vec<f32>),
}

impl Default for Alphas {
    fn default() -> Self {
        Alphas::Uniform(DEFAULT_OVERLAY_ALPHA)
    }
}

impl Alphas {
    /// Expand to exactly `count` values, each in [0, 1].
    pub fn resolve(&self, count: usize) -> Result<Vec<f32>> {
        let alphas = match self {
            Alphas::Uniform(alpha) => vec![*alpha; count],
            Alphas::PerMask(alphas) if alphas.len() == count => alphas.clone(),
            Alphas::PerMask(alphas) => {
                return Err(EditError::invalid(format!(
                    "got {} alphas for {} masks",
                    alphas.len(),
                    count
                )))
            }
        };
        for alpha in &alphas {
            check_unit("alpha", *alpha)?;
        }
        Ok(alphas)
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(EditError::invalid(format!(
            "{} must be in [0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}

/// Masks from one segmentation call together with the image they were
/// predicted on.
#[derive(Debug, Clone, PartialEq)]
pub struct Segmentation {
    pub image: Arc<RgbImage>,
    pub generation: u64,
    pub masks: Vec<Mask>,
    pub scores: Vec<f32>,
}

impl Segmentation {
    /// Composite the masks over their source image in the overlay tint.
    pub fn overlay(&self, alphas: &[f32]) -> Result<RgbImage> {
        alpha_composite_masks(&self.image, &self.masks, alphas, OVERLAY_TINT)
    }
}

pub struct SegmentationOrchestrator {
    backend: Arc<dyn SegmentationBackend>,
    runner: InferenceRunner,
}

impl SegmentationOrchestrator {
    pub fn new(backend: Arc<dyn SegmentationBackend>, runner: InferenceRunner) -> Self {
        Self { backend, runner }
    }

    /// Segment the object under a normalized click. Returns exactly one mask.
    pub async fn segment_by_point(
        &self,
        session: &SessionHandle,
        nx: f32,
        ny: f32,
        label: PointLabel,
    ) -> Result<Segmentation> {
        check_unit("normalized_x", nx)?;
        check_unit("normalized_y", ny)?;

        let (image, generation) = session.read().await.snapshot()?;
        let (x, y) = denormalize_point(nx, ny, image.width(), image.height())?;
        info!("Segmenting by point ({:.1}, {:.1}) label={:?}", x, y, label);

        let prompt = SegmentationPrompt::Points(vec![PixelPoint { x, y, label }]);
        self.predict(session, image, generation, prompt, 1).await
    }

    /// Segment one object per normalized center-form box.
    pub async fn segment_by_boxes(
        &self,
        session: &SessionHandle,
        boxes: &[CenterBox],
    ) -> Result<Segmentation> {
        if boxes.is_empty() {
            return Err(EditError::invalid("at least one box is required"));
        }
        for b in boxes {
            b.validate_normalized()?;
        }

        let (image, generation) = session.read().await.snapshot()?;
        let (width, height) = (image.width() as f32, image.height() as f32);
        let corners = centers_to_corners(boxes)
            .into_iter()
            .map(|b| b.scale(width, height))
            .collect::<Vec<_>>();
        info!("Segmenting by {} box(es)", corners.len());
        debug!("Pixel boxes: {:?}", corners);

        self.predict(
            session,
            image,
            generation,
            SegmentationPrompt::Boxes(corners),
            boxes.len(),
        )
        .await
    }

    /// Run the model on `image` and store the result if `generation` is
    /// still the session's current one.
    async fn predict(
        &self,
        session: &SessionHandle,
        image: Arc<RgbImage>,
        generation: u64,
        prompt: SegmentationPrompt,
        expected_masks: usize,
    ) -> Result<Segmentation> {
        let backend = Arc::clone(&self.backend);
        let input = Arc::clone(&image);
        let output = self
            .runner
            .run("sam2", move || backend.predict(&input, &prompt, false))
            .await?;

        if output.masks.len() != expected_masks {
            return Err(EditError::Backend(anyhow!(
                "expected {} mask(s), segmentation returned {}",
                expected_masks,
                output.masks.len()
            )));
        }
        if output.scores.len() != output.masks.len() {
            return Err(EditError::Backend(anyhow!(
                "segmentation returned {} scores for {} masks",
                output.scores.len(),
                output.masks.len()
            )));
        }
        for mask in &output.masks {
            if mask.dimensions() != image.dimensions() {
                return Err(EditError::DimensionMismatch {
                    expected: image.dimensions(),
                    actual: mask.dimensions(),
                });
            }
        }

        let masks = output.masks.clone();
        let scores = output.scores.clone();
        session.write().await.store_segmentation(generation, output)?;
        debug!("Stored {} mask(s) for generation {}", masks.len(), generation);
        Ok(Segmentation {
            image,
            generation,
            masks,
            scores,
        })
    }
}
