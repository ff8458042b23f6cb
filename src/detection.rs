//! Open-vocabulary detection against a session image.

use std::sync::Arc;

use anyhow::anyhow;
use tracing::info;

use crate::config::DetectionThresholds;
use crate::error::{EditError, Result};
use crate::geometry::stable_argmax;
use crate::models::DetectionBackend;
use crate::session::SessionHandle;
use crate::types::DetectionSet;
use crate::worker::InferenceRunner;

pub struct DetectionOrchestrator {
    backend: Arc<dyn DetectionBackend>,
    thresholds: DetectionThresholds,
    runner: InferenceRunner,
}

impl DetectionOrchestrator {
    pub fn new(
        backend: Arc<dyn DetectionBackend>,
        thresholds: DetectionThresholds,
        runner: InferenceRunner,
    ) -> Self {
        Self {
            backend,
            thresholds,
            runner,
        }
    }

    /// Detect `text_prompt` in the session image.
    ///
    /// With `single_target` only the best scoring detection is kept;
    /// otherwise detections come back in the detector's order.
    pub async fn detect(
        &self,
        session: &SessionHandle,
        text_prompt: &str,
        single_target: bool,
    ) -> Result<DetectionSet> {
        if text_prompt.trim().is_empty() {
            return Err(EditError::invalid("detection prompt must not be empty"));
        }
        let (image, generation) = session.read().await.snapshot()?;

        let backend = Arc::clone(&self.backend);
        let caption = text_prompt.to_string();
        let thresholds = self.thresholds;
        let detections = self
            .runner
            .run("grounding-dino", move || {
                backend.detect(&image, &caption, &thresholds)
            })
            .await?;

        if !detections.is_aligned() {
            return Err(EditError::Backend(anyhow!(
                "detector returned {} boxes, {} scores and {} phrases",
                detections.boxes.len(),
                detections.scores.len(),
                detections.phrases.len()
            )));
        }

        let detections = if single_target {
            match stable_argmax(&detections.scores) {
                Some(best) => detections.select(best),
                None => DetectionSet::default(),
            }
        } else {
            detections
        };
        info!(
            "Detected {} object(s) for '{}'",
            detections.len(),
            text_prompt
        );

        session
            .write()
            .await
            .store_detections(generation, detections.clone())?;
        Ok(detections)
    }
}
