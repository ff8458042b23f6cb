//! Deterministic model stand-ins shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use image::{GrayImage, ImageFormat, Rgb, RgbImage};

use sam_inpaint::config::{DetectionThresholds, ServiceConfig};
use sam_inpaint::models::{
    DetectionBackend, GenerationRequest, GenerativeInpaintBackend, SegmentationBackend,
    SegmentationOutput, SegmentationPrompt, SimilarityScorer,
};
use sam_inpaint::pipeline::{Backends, EditPipeline};
use sam_inpaint::types::{DetectionSet, Mask};

/// Square segmenter: a 21px square per click, the box itself per box.
#[derive(Default)]
pub struct StubSegmenter {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    pub delay: Mutex<Option<Duration>>,
}

impl SegmentationBackend for StubSegmenter {
    fn predict(
        &self,
        image: &RgbImage,
        prompt: &SegmentationPrompt,
        _multimask_output: bool,
    ) -> anyhow::Result<SegmentationOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = *self.delay.lock().map_err(|e| anyhow!("{}", e))? {
            std::thread::sleep(delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!("segmentation model crashed");
        }
        let (w, h) = image.dimensions();
        let masks: Vec<Mask> = match prompt {
            SegmentationPrompt::Points(points) => points
                .iter()
                .map(|p| {
                    Mask::from_fn(w, h, |x, y| {
                        (x as f32 - p.x).abs() <= 10.0 && (y as f32 - p.y).abs() <= 10.0
                    })
                })
                .collect(),
            SegmentationPrompt::Boxes(boxes) => boxes
                .iter()
                .map(|b| {
                    Mask::from_fn(w, h, |x, y| {
                        let (x, y) = (x as f32, y as f32);
                        x >= b.x1 && x < b.x2 && y >= b.y1 && y < b.y2
                    })
                })
                .collect(),
        };
        let scores = vec![0.9; masks.len()];
        Ok(SegmentationOutput {
            masks,
            scores,
            logits: Vec::new(),
        })
    }
}

/// Detector that always reports the same set.
pub struct StubDetector {
    pub detections: DetectionSet,
    pub captions: Mutex<Vec<String>>,
}

impl StubDetector {
    pub fn new(detections: DetectionSet) -> Self {
        Self {
            detections,
            captions: Mutex::new(Vec::new()),
        }
    }
}

impl DetectionBackend for StubDetector {
    fn detect(
        &self,
        _image: &RgbImage,
        caption: &str,
        _thresholds: &DetectionThresholds,
    ) -> anyhow::Result<DetectionSet> {
        self.captions
            .lock()
            .map_err(|e| anyhow!("{}", e))?
            .push(caption.to_string());
        Ok(self.detections.clone())
    }
}

/// Generator that paints candidate `i` a flat grey of `40 * (i + 1)`.
#[derive(Default)]
pub struct StubGenerator {
    pub seeds: Mutex<Vec<u64>>,
    pub prompts: Mutex<Vec<String>>,
    pub masks: Mutex<Vec<GrayImage>>,
}

impl GenerativeInpaintBackend for StubGenerator {
    fn generate(&self, request: &GenerationRequest<'_>) -> anyhow::Result<RgbImage> {
        let mut seeds = self.seeds.lock().map_err(|e| anyhow!("{}", e))?;
        seeds.push(request.seed);
        self.prompts
            .lock()
            .map_err(|e| anyhow!("{}", e))?
            .push(request.prompt.to_string());
        self.masks
            .lock()
            .map_err(|e| anyhow!("{}", e))?
            .push(request.mask.clone());
        let shade = (40 * seeds.len()).min(255) as u8;
        let (w, h) = request.image.dimensions();
        Ok(RgbImage::from_pixel(w, h, Rgb([shade, shade, shade])))
    }
}

/// Scorer handing out a fixed sequence of scores.
pub struct StubScorer {
    pub scores: Mutex<VecDeque<f32>>,
    pub texts: Mutex<Vec<String>>,
}

impl StubScorer {
    pub fn new(scores: &[f32]) -> Self {
        Self {
            scores: Mutex::new(scores.iter().copied().collect()),
            texts: Mutex::new(Vec::new()),
        }
    }
}

impl SimilarityScorer for StubScorer {
    fn score(&self, _image: &RgbImage, text: &str) -> anyhow::Result<f32> {
        self.texts
            .lock()
            .map_err(|e| anyhow!("{}", e))?
            .push(text.to_string());
        self.scores
            .lock()
            .map_err(|e| anyhow!("{}", e))?
            .pop_front()
            .ok_or_else(|| anyhow!("scorer ran out of scores"))
    }
}

pub struct Harness {
    pub pipeline: Arc<EditPipeline>,
    pub segmenter: Arc<StubSegmenter>,
    pub detector: Arc<StubDetector>,
    pub generator: Arc<StubGenerator>,
    pub scorer: Arc<StubScorer>,
}

pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        working_size: 64,
        inference_timeout: Duration::from_secs(5),
        max_concurrent_inferences: 2,
        ..ServiceConfig::default()
    }
}

pub fn harness(detections: DetectionSet, scores: &[f32]) -> Harness {
    harness_with_config(detections, scores, &test_config())
}

pub fn harness_with_config(
    detections: DetectionSet,
    scores: &[f32],
    config: &ServiceConfig,
) -> Harness {
    let segmenter = Arc::new(StubSegmenter::default());
    let detector = Arc::new(StubDetector::new(detections));
    let generator = Arc::new(StubGenerator::default());
    let scorer = Arc::new(StubScorer::new(scores));
    let backends = Backends {
        segmentation: segmenter.clone(),
        detection: detector.clone(),
        generator: generator.clone(),
        scorer: scorer.clone(),
    };
    let pipeline = Arc::new(EditPipeline::new(backends, config).unwrap());
    Harness {
        pipeline,
        segmenter,
        detector,
        generator,
        scorer,
    }
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

pub fn sample_detections() -> DetectionSet {
    DetectionSet {
        boxes: vec![
            [0.25, 0.25, 0.2, 0.2].into(),
            [0.75, 0.5, 0.3, 0.4].into(),
            [0.5, 0.75, 0.1, 0.1].into(),
        ],
        scores: vec![0.4, 0.8, 0.8],
        phrases: vec!["cat".into(), "dog".into(), "dog".into()],
    }
}
