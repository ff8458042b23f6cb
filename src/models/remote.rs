//! Capability backends served by external model servers over HTTP/JSON.
//!
//! Images travel as base64 PNG. Every endpoint is a single POST:
//!
//! | Capability | Path | Response |
//! |---|---|---|
//! | segmentation | `/segment` | `{masks_png_b64, scores, low_res_logits?}` |
//! | detection | `/detect` | `{boxes: [[cx,cy,w,h]], logits, phrases}` |
//! | inpainting | `/inpaint` | `{image_png_b64}` |
//! | similarity | `/score` | `{score}` |

use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use image::{GrayImage, RgbImage};
use ndarray::Array2;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::preprocessing::{encode_gray_png, encode_png};
use super::{
    DetectionBackend, GenerationRequest, GenerativeInpaintBackend, SegmentationBackend,
    SegmentationOutput, SegmentationPrompt, SimilarityScorer,
};
use crate::config::DetectionThresholds;
use crate::types::{CenterBox, DetectionSet, Mask};

/// Blocking JSON client bound to one model server.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: reqwest::blocking::Client,
    base_url: String,
}

impl RemoteClient {
    /// Must be called outside of an async context.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post<Req: Serialize, Resp: DeserializeOwned>(&self, path: &str, body: &Req) -> Result<Resp> {
        let url = format!("{}/{}", self.base_url, path);
        debug!("POST {}", url);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .with_context(|| format!("Request to {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            bail!("{} returned {}: {}", url, status, detail);
        }
        response
            .json()
            .with_context(|| format!("Invalid response body from {}", url))
    }
}

fn png_b64(image: &RgbImage) -> Result<String> {
    Ok(B64.encode(encode_png(image)?))
}

fn decode_png_b64(data: &str) -> Result<image::DynamicImage> {
    let bytes = B64.decode(data.as_bytes()).context("invalid base64")?;
    image::load_from_memory(&bytes).context("invalid PNG payload")
}

#[derive(Debug, Serialize)]
struct WirePoint {
    x: f32,
    y: f32,
    label: u8,
}

#[derive(Debug, Serialize)]
struct SegmentRequestBody {
    image_png_b64: String,
    points: Vec<WirePoint>,
    boxes: Vec<[f32; 4]>,
    multimask_output: bool,
}

#[derive(Debug, Deserialize)]
pub struct SegmentResponseBody {
    pub masks_png_b64: Vec<String>,
    pub scores: Vec<f32>,
    #[serde(default)]
    pub low_res_logits: Vec<Vec<Vec<f32>>>,
}

fn logits_to_array(rows: &[Vec<f32>]) -> Result<Array2<f32>> {
    let height = rows.len();
    let width = rows.first().map(Vec::len).unwrap_or(0);
    if rows.iter().any(|r| r.len() != width) {
        bail!("logit rows have uneven length");
    }
    let flat = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((height, width), flat).context("bad logit shape")
}

pub fn decode_segment_response(body: SegmentResponseBody) -> Result<SegmentationOutput> {
    let masks = body
        .masks_png_b64
        .iter()
        .map(|m| decode_png_b64(m).map(|img| Mask::from_gray(&img.to_luma8(), 127)))
        .collect::<Result<Vec<_>>>()?;
    if body.scores.len() != masks.len() {
        bail!(
            "segmentation returned {} masks but {} scores",
            masks.len(),
            body.scores.len()
        );
    }
    let logits = body
        .low_res_logits
        .iter()
        .map(|l| logits_to_array(l))
        .collect::<Result<Vec<_>>>()?;
    if !logits.is_empty() && logits.len() != masks.len() {
        bail!(
            "segmentation returned {} masks but {} logit maps",
            masks.len(),
            logits.len()
        );
    }
    Ok(SegmentationOutput {
        masks,
        scores: body.scores,
        logits,
    })
}

/// SAM2 image predictor behind `/segment`.
#[derive(Debug, Clone)]
pub struct RemoteSegmenter {
    client: RemoteClient,
}

impl RemoteSegmenter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: RemoteClient::new(base_url, timeout)?,
        })
    }
}

impl SegmentationBackend for RemoteSegmenter {
    fn predict(
        &self,
        image: &RgbImage,
        prompt: &SegmentationPrompt,
        multimask_output: bool,
    ) -> Result<SegmentationOutput> {
        let (points, boxes) = match prompt {
            SegmentationPrompt::Points(points) => (
                points
                    .iter()
                    .map(|p| WirePoint {
                        x: p.x,
                        y: p.y,
                        label: p.label.into(),
                    })
                    .collect(),
                Vec::new(),
            ),
            SegmentationPrompt::Boxes(boxes) => {
                (Vec::new(), boxes.iter().map(|b| b.to_array()).collect())
            }
        };
        let body = SegmentRequestBody {
            image_png_b64: png_b64(image)?,
            points,
            boxes,
            multimask_output,
        };
        decode_segment_response(self.client.post("segment", &body)?)
    }
}

#[derive(Debug, Serialize)]
struct DetectRequestBody<'a> {
    image_png_b64: String,
    caption: &'a str,
    box_threshold: f32,
    text_threshold: f32,
}

#[derive(Debug, Deserialize)]
pub struct DetectResponseBody {
    pub boxes: Vec<[f32; 4]>,
    pub logits: Vec<f32>,
    pub phrases: Vec<String>,
}

impl From<DetectResponseBody> for DetectionSet {
    fn from(body: DetectResponseBody) -> Self {
        DetectionSet {
            boxes: body.boxes.into_iter().map(CenterBox::from).collect(),
            scores: body.logits,
            phrases: body.phrases,
        }
    }
}

/// GroundingDINO behind `/detect`.
#[derive(Debug, Clone)]
pub struct RemoteDetector {
    client: RemoteClient,
}

impl RemoteDetector {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: RemoteClient::new(base_url, timeout)?,
        })
    }
}

impl DetectionBackend for RemoteDetector {
    fn detect(
        &self,
        image: &RgbImage,
        caption: &str,
        thresholds: &DetectionThresholds,
    ) -> Result<DetectionSet> {
        let body = DetectRequestBody {
            image_png_b64: png_b64(image)?,
            caption,
            box_threshold: thresholds.box_threshold,
            text_threshold: thresholds.text_threshold,
        };
        let response: DetectResponseBody = self.client.post("detect", &body)?;
        Ok(response.into())
    }
}

#[derive(Debug, Serialize)]
struct InpaintRequestBody<'a> {
    image_png_b64: String,
    mask_png_b64: String,
    control_image_png_b64: String,
    prompt: &'a str,
    num_inference_steps: u32,
    guidance_scale: f32,
    controlnet_conditioning_scale: f32,
    eta: f32,
    seed: u64,
}

#[derive(Debug, Deserialize)]
struct ImageResponseBody {
    image_png_b64: String,
}

/// ControlNet inpainting pipeline behind `/inpaint`.
#[derive(Debug, Clone)]
pub struct RemoteGenerator {
    client: RemoteClient,
}

impl RemoteGenerator {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: RemoteClient::new(base_url, timeout)?,
        })
    }
}

fn gray_png_b64(mask: &GrayImage) -> Result<String> {
    Ok(B64.encode(encode_gray_png(mask)?))
}

impl GenerativeInpaintBackend for RemoteGenerator {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<RgbImage> {
        let body = InpaintRequestBody {
            image_png_b64: png_b64(request.image)?,
            mask_png_b64: gray_png_b64(request.mask)?,
            control_image_png_b64: png_b64(request.control_image)?,
            prompt: request.prompt,
            num_inference_steps: request.num_inference_steps,
            guidance_scale: request.guidance_scale,
            controlnet_conditioning_scale: request.controlnet_conditioning_scale,
            eta: request.eta,
            seed: request.seed,
        };
        let response: ImageResponseBody = self.client.post("inpaint", &body)?;
        Ok(decode_png_b64(&response.image_png_b64)?.to_rgb8())
    }
}

#[derive(Debug, Serialize)]
struct ScoreRequestBody<'a> {
    image_png_b64: String,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct ScoreResponseBody {
    score: f32,
}

/// CLIP image-text similarity behind `/score`.
#[derive(Debug, Clone)]
pub struct RemoteScorer {
    client: RemoteClient,
}

impl RemoteScorer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: RemoteClient::new(base_url, timeout)?,
        })
    }
}

impl SimilarityScorer for RemoteScorer {
    fn score(&self, image: &RgbImage, text: &str) -> Result<f32> {
        let body = ScoreRequestBody {
            image_png_b64: png_b64(image)?,
            text,
        };
        let response: ScoreResponseBody = self.client.post("score", &body)?;
        Ok(response.score)
    }
}
