//! Text-guided inpainting of a masked region of the session image.
//!
//! The request is prepared at a square working resolution, `num_samples`
//! candidates are generated with independent seeds, every candidate is scored
//! against the original prompt and the best one is kept.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use image::{GrayImage, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EditError, Result};
use crate::geometry::{rescale_mask_about_center, stable_argmax};
use crate::models::preprocessing::{blur_mask, restore_original_size};
use crate::models::{
    enhance_prompt, letterbox_image, letterbox_mask, make_edge_condition,
    match_color_distribution, GenerationRequest, GenerativeInpaintBackend, SimilarityScorer,
};
use crate::session::SessionHandle;
use crate::types::{InpaintingResult, Mask};
use crate::worker::InferenceRunner;

/// Per-sample seeds are drawn from `[0, MAX_SEED)`.
pub const MAX_SEED: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostprocessMode {
    None,
    /// Match per-channel mean/std of the result to the source image.
    #[default]
    ColorMatch,
}

/// Generation knobs, each settable per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InpaintOptions {
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub controlnet_conditioning_scale: f32,
    pub eta: f32,
    pub num_samples: usize,
    pub is_applying_blur: bool,
    /// Gaussian sigma in pixels of the source image.
    pub blur_radius: f32,
    pub using_canny_control_image: bool,
    pub postprocess_mode: PostprocessMode,
    pub mask_rescale: f32,
    pub restore_original_size: bool,
    pub seed: Option<u64>,
}

impl Default for InpaintOptions {
    fn default() -> Self {
        Self {
            num_inference_steps: 20,
            guidance_scale: 10.0,
            controlnet_conditioning_scale: 0.2,
            eta: 1.0,
            num_samples: 2,
            is_applying_blur: true,
            blur_radius: 10.0,
            using_canny_control_image: false,
            postprocess_mode: PostprocessMode::ColorMatch,
            mask_rescale: 1.0,
            restore_original_size: false,
            seed: None,
        }
    }
}

impl InpaintOptions {
    pub fn validate(&self) -> Result<()> {
        if self.num_samples < 1 {
            return Err(EditError::invalid("num_samples must be at least 1"));
        }
        if !(self.mask_rescale.is_finite() && self.mask_rescale > 0.0) {
            return Err(EditError::invalid(format!(
                "mask_rescale must be positive, got {}",
                self.mask_rescale
            )));
        }
        if self.num_inference_steps < 1 {
            return Err(EditError::invalid("num_inference_steps must be at least 1"));
        }
        if !self.guidance_scale.is_finite() || !self.eta.is_finite() {
            return Err(EditError::invalid("guidance_scale and eta must be finite"));
        }
        if !(self.controlnet_conditioning_scale.is_finite()
            && self.controlnet_conditioning_scale >= 0.0)
        {
            return Err(EditError::invalid(
                "controlnet_conditioning_scale must be non-negative",
            ));
        }
        if self.is_applying_blur && !(self.blur_radius.is_finite() && self.blur_radius > 0.0) {
            return Err(EditError::invalid(format!(
                "blur_radius must be positive, got {}",
                self.blur_radius
            )));
        }
        Ok(())
    }
}

/// Inputs to the generative model at working resolution.
#[derive(Debug, Clone)]
pub struct PreparedInputs {
    pub image: RgbImage,
    /// 0/255 mask aligned with `image`.
    pub mask: GrayImage,
    pub control_image: RgbImage,
}

/// Rescale, blur and letterbox the mask and image to `working_size`.
pub fn prepare_inputs(
    image: &RgbImage,
    mask: &Mask,
    options: &InpaintOptions,
    working_size: u32,
) -> Result<PreparedInputs> {
    if mask.dimensions() != image.dimensions() {
        return Err(EditError::DimensionMismatch {
            expected: image.dimensions(),
            actual: mask.dimensions(),
        });
    }

    let mask = rescale_mask_about_center(mask, options.mask_rescale)?;
    let mut gray = mask.to_gray();
    if options.is_applying_blur {
        gray = blur_mask(&gray, options.blur_radius);
    }
    let working_mask = letterbox_mask(&gray, working_size).to_gray();
    let working_image = letterbox_image(image, working_size);
    let control_image = if options.using_canny_control_image {
        make_edge_condition(&working_image)
    } else {
        working_image.clone()
    };

    Ok(PreparedInputs {
        image: working_image,
        mask: working_mask,
        control_image,
    })
}

/// Draw `count` seeds, reproducibly when a base seed is given.
pub fn draw_seeds(count: usize, base: Option<u64>) -> Vec<u64> {
    let mut rng = match base {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    (0..count).map(|_| rng.gen_range(0..MAX_SEED)).collect()
}

pub struct InpaintingOrchestrator {
    generator: Arc<dyn GenerativeInpaintBackend>,
    scorer: Arc<dyn SimilarityScorer>,
    working_size: u32,
    runner: InferenceRunner,
}

impl InpaintingOrchestrator {
    pub fn new(
        generator: Arc<dyn GenerativeInpaintBackend>,
        scorer: Arc<dyn SimilarityScorer>,
        working_size: u32,
        runner: InferenceRunner,
    ) -> Self {
        Self {
            generator,
            scorer,
            working_size,
            runner,
        }
    }

    /// Inpaint the masked region of the session image.
    ///
    /// Without an explicit `mask` the union of the session's latest
    /// segmentation masks is used.
    pub async fn inpaint(
        &self,
        session: &SessionHandle,
        mask: Option<Mask>,
        prompt: &str,
        options: &InpaintOptions,
    ) -> Result<InpaintingResult> {
        options.validate()?;
        if prompt.trim().is_empty() {
            return Err(EditError::invalid("inpainting prompt must not be empty"));
        }

        let (image, mask) = {
            let session = session.read().await;
            let image = session.get_image()?;
            let mask = match mask {
                Some(mask) => mask,
                None => Mask::union_all(session.masks())?.ok_or_else(|| {
                    EditError::invalid("no mask supplied and the session has no masks")
                })?,
            };
            (image, mask)
        };
        if mask.dimensions() != image.dimensions() {
            return Err(EditError::DimensionMismatch {
                expected: image.dimensions(),
                actual: mask.dimensions(),
            });
        }
        let seeds = draw_seeds(options.num_samples, options.seed);
        info!(
            "Inpainting '{}' with {} sample(s) at {}px",
            prompt, options.num_samples, self.working_size
        );

        let generator = Arc::clone(&self.generator);
        let scorer = Arc::clone(&self.scorer);
        let prompt = prompt.to_string();
        let options = options.clone();
        let working_size = self.working_size;
        self.runner
            .run("inpainting", move || {
                let prepared = prepare_inputs(&image, &mask, &options, working_size)?;
                generate_best(
                    generator.as_ref(),
                    scorer.as_ref(),
                    &image,
                    &prepared,
                    &prompt,
                    &options,
                    &seeds,
                )
            })
            .await
    }
}

/// Generate one candidate per seed, score each against the plain prompt and
/// post-process the winner.
pub fn generate_best(
    generator: &dyn GenerativeInpaintBackend,
    scorer: &dyn SimilarityScorer,
    source: &RgbImage,
    prepared: &PreparedInputs,
    prompt: &str,
    options: &InpaintOptions,
    seeds: &[u64],
) -> anyhow::Result<InpaintingResult> {
    let enhanced = enhance_prompt(prompt);
    let mut candidates = Vec::with_capacity(seeds.len());
    let mut scores = Vec::with_capacity(seeds.len());

    for (i, &seed) in seeds.iter().enumerate() {
        let request = GenerationRequest {
            image: &prepared.image,
            mask: &prepared.mask,
            control_image: &prepared.control_image,
            prompt: &enhanced,
            num_inference_steps: options.num_inference_steps,
            guidance_scale: options.guidance_scale,
            controlnet_conditioning_scale: options.controlnet_conditioning_scale,
            eta: options.eta,
            seed,
        };
        let candidate = generator
            .generate(&request)
            .with_context(|| format!("generation of sample {} failed", i))?;
        let score = scorer
            .score(&candidate, prompt)
            .with_context(|| format!("scoring of sample {} failed", i))?;
        debug!("Sample {} (seed {}) scored {}", i, seed, score);
        candidates.push(candidate);
        scores.push(score);
    }

    let best = stable_argmax(&scores).ok_or_else(|| anyhow!("no candidate received a valid score"))?;
    let mut image = candidates.swap_remove(best);
    if options.restore_original_size {
        image = restore_original_size(&image, source.dimensions());
    }
    if options.postprocess_mode == PostprocessMode::ColorMatch {
        image = match_color_distribution(&image, source)?;
    }

    Ok(InpaintingResult {
        image,
        clip_score: scores[best],
        seed: seeds[best],
        candidate_scores: scores,
    })
}
