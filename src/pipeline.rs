//! Editing pipeline tying the session store to the three orchestrators.

use std::sync::Arc;

use tracing::info;

use crate::config::ServiceConfig;
use crate::detection::DetectionOrchestrator;
use crate::error::{EditError, Result};
use crate::inpainting::{InpaintOptions, InpaintingOrchestrator};
use crate::models::{
    DetectionBackend, GenerativeInpaintBackend, SegmentationBackend, SimilarityScorer,
};
use crate::segmentation::{Segmentation, SegmentationOrchestrator};
use crate::session::{
    check_upload_extension, Session, SessionHandle, SessionId, SessionLimits, SessionStatus,
    SessionStore,
};
use crate::types::{DetectionSet, InpaintingResult, Mask, Prompt};
use crate::worker::InferenceRunner;

/// Model collaborators the pipeline is built from.
#[derive(Clone)]
pub struct Backends {
    pub segmentation: Arc<dyn SegmentationBackend>,
    pub detection: Arc<dyn DetectionBackend>,
    pub generator: Arc<dyn GenerativeInpaintBackend>,
    pub scorer: Arc<dyn SimilarityScorer>,
}

/// What a [`Prompt`] produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptOutcome {
    Masks(Segmentation),
    Detections(DetectionSet),
}

pub struct EditPipeline {
    sessions: SessionStore,
    segmentation: SegmentationOrchestrator,
    detection: DetectionOrchestrator,
    inpainting: InpaintingOrchestrator,
}

impl EditPipeline {
    /// Create a pipeline. All orchestrators share one inference runner so
    /// the concurrency limit covers every model.
    pub fn new(backends: Backends, config: &ServiceConfig) -> Result<Self> {
        config.validate()?;
        let runner = InferenceRunner::new(
            config.max_concurrent_inferences,
            config.inference_timeout,
        );
        info!(
            "Initializing edit pipeline (working size {}, {} concurrent inference(s), timeout {:?})",
            config.working_size, config.max_concurrent_inferences, config.inference_timeout
        );
        info!(
            "Keeping at most {} session(s), idle sessions expire after {:?}",
            config.max_sessions, config.session_idle_ttl
        );

        Ok(Self {
            sessions: SessionStore::new(SessionLimits {
                max_sessions: config.max_sessions,
                idle_ttl: config.session_idle_ttl,
            }),
            segmentation: SegmentationOrchestrator::new(backends.segmentation, runner.clone()),
            detection: DetectionOrchestrator::new(
                backends.detection,
                config.detection,
                runner.clone(),
            ),
            inpainting: InpaintingOrchestrator::new(
                backends.generator,
                backends.scorer,
                config.working_size,
                runner,
            ),
        })
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Existing session for `id`. Never creates one.
    pub async fn session(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(id).await
    }

    /// Existing session for an operation that needs a staged image.
    async fn staged(&self, id: &SessionId) -> Result<SessionHandle> {
        self.sessions.get(id).await.ok_or(EditError::NoImage)
    }

    /// Register a fresh session and return its id.
    pub async fn create_session(&self) -> SessionId {
        let id = SessionId::generate();
        self.sessions.handle(&id).await;
        id
    }

    pub async fn drop_session(&self, id: &SessionId) -> bool {
        self.sessions.remove(id).await
    }

    /// Stage an uploaded image. The file name is checked before decoding.
    pub async fn set_image(
        &self,
        id: &SessionId,
        filename: &str,
        bytes: &[u8],
    ) -> Result<SessionStatus> {
        check_upload_extension(filename)?;
        let handle = self.sessions.handle(id).await;
        let mut session = handle.write().await;
        session.set_image(bytes)?;
        info!("Session {} staged '{}'", id, filename);
        Ok(session.status(id))
    }

    /// Status of `id`. Unknown sessions report as empty.
    pub async fn status(&self, id: &SessionId) -> SessionStatus {
        match self.session(id).await {
            Some(handle) => handle.read().await.status(id),
            None => Session::new().status(id),
        }
    }

    /// Masks from the latest segmentation call, empty if there was none.
    pub async fn masks(&self, id: &SessionId) -> Result<Vec<Mask>> {
        let handle = self.staged(id).await?;
        let session = handle.read().await;
        session.get_image()?;
        Ok(session.masks().to_vec())
    }

    /// Detections from the latest text prompt, empty if there was none.
    pub async fn detections(&self, id: &SessionId) -> Result<DetectionSet> {
        let handle = self.staged(id).await?;
        let session = handle.read().await;
        session.get_image()?;
        Ok(session.detections().cloned().unwrap_or_default())
    }

    /// Route a prompt to the orchestrator that understands it.
    pub async fn prompt(&self, id: &SessionId, prompt: Prompt) -> Result<PromptOutcome> {
        let session = self.staged(id).await?;
        match prompt {
            Prompt::Point { x, y, label } => self
                .segmentation
                .segment_by_point(&session, x, y, label)
                .await
                .map(PromptOutcome::Masks),
            Prompt::BoxSet(boxes) => self
                .segmentation
                .segment_by_boxes(&session, &boxes)
                .await
                .map(PromptOutcome::Masks),
            Prompt::Text {
                prompt,
                single_target,
            } => self
                .detection
                .detect(&session, &prompt, single_target)
                .await
                .map(PromptOutcome::Detections),
        }
    }

    pub async fn inpaint(
        &self,
        id: &SessionId,
        mask: Option<Mask>,
        prompt: &str,
        options: &InpaintOptions,
    ) -> Result<InpaintingResult> {
        let session = self.staged(id).await?;
        self.inpainting.inpaint(&session, mask, prompt, options).await
    }
}
