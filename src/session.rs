//! Per-client editing state: the staged image and the latest inference
//! artifacts, plus the store that hands sessions out by id.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EditError, Result};
use crate::models::SegmentationOutput;
use crate::types::{DetectionSet, Mask};

/// Upload extensions accepted by the `set_image` endpoints.
pub const ALLOWED_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Session used when a client does not name one.
pub const DEFAULT_SESSION: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id for a new client.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self(DEFAULT_SESSION.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reject an upload by file name before touching its bytes.
pub fn check_upload_extension(filename: &str) -> Result<()> {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .unwrap_or(filename)
        .to_lowercase();
    if ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(EditError::InvalidFormat(format!(
            "'{}' is not one of {}",
            filename,
            ALLOWED_EXTENSIONS.join(", ")
        )))
    }
}

/// Decode any supported raster format to 8-bit RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes)?;
    Ok(image.to_rgb8())
}

/// Working state for one client.
#[derive(Debug, Default)]
pub struct Session {
    source_image: Option<Arc<RgbImage>>,
    /// Bumped on every image change so late inference results can be told apart.
    generation: u64,
    last_masks: Vec<Mask>,
    last_scores: Vec<f32>,
    last_logits: Vec<Array2<f32>>,
    last_detections: Option<DetectionSet>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and stage an image, dropping every previous artifact.
    pub fn set_image(&mut self, bytes: &[u8]) -> Result<()> {
        let image = decode_image(bytes)?;
        self.replace_image(image);
        Ok(())
    }

    pub fn replace_image(&mut self, image: RgbImage) {
        debug!("Staging image {}x{}", image.width(), image.height());
        self.source_image = Some(Arc::new(image));
        self.generation += 1;
        self.last_masks.clear();
        self.last_scores.clear();
        self.last_logits.clear();
        self.last_detections = None;
    }

    pub fn get_image(&self) -> Result<Arc<RgbImage>> {
        self.source_image.clone().ok_or(EditError::NoImage)
    }

    /// Image plus the generation it belongs to, for write-after-complete.
    pub fn snapshot(&self) -> Result<(Arc<RgbImage>, u64)> {
        Ok((self.get_image()?, self.generation))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn masks(&self) -> &[Mask] {
        &self.last_masks
    }

    pub fn scores(&self) -> &[f32] {
        &self.last_scores
    }

    pub fn logits(&self) -> &[Array2<f32>] {
        &self.last_logits
    }

    pub fn detections(&self) -> Option<&DetectionSet> {
        self.last_detections.as_ref()
    }

    fn check_generation(&self, generation: u64) -> Result<()> {
        if self.source_image.is_none() || generation != self.generation {
            return Err(EditError::ImageReplaced);
        }
        Ok(())
    }

    /// Replace the segmentation artifacts with a completed result.
    pub fn store_segmentation(&mut self, generation: u64, output: SegmentationOutput) -> Result<()> {
        self.check_generation(generation)?;
        let image = self.get_image()?;
        for mask in &output.masks {
            if mask.dimensions() != image.dimensions() {
                return Err(EditError::DimensionMismatch {
                    expected: image.dimensions(),
                    actual: mask.dimensions(),
                });
            }
        }
        self.last_masks = output.masks;
        self.last_scores = output.scores;
        self.last_logits = output.logits;
        Ok(())
    }

    pub fn store_detections(&mut self, generation: u64, detections: DetectionSet) -> Result<()> {
        self.check_generation(generation)?;
        self.last_detections = Some(detections);
        Ok(())
    }

    pub fn status(&self, id: &SessionId) -> SessionStatus {
        let extent = self.source_image.as_ref().map(|img| img.dimensions());
        SessionStatus {
            session_id: id.clone(),
            has_image: extent.is_some(),
            width: extent.map(|(w, _)| w),
            height: extent.map(|(_, h)| h),
            mask_count: self.last_masks.len(),
            detection_count: self.last_detections.as_ref().map_or(0, DetectionSet::len),
            generation: self.generation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub has_image: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub mask_count: usize,
    pub detection_count: usize,
    pub generation: u64,
}

pub type SessionHandle = Arc<RwLock<Session>>;

/// Bounds on how many sessions are kept and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_sessions: usize,
    /// Sessions untouched for this long are dropped.
    pub idle_ttl: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            idle_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug)]
struct Entry {
    handle: SessionHandle,
    last_used: Instant,
}

/// Sessions keyed by client-supplied id.
///
/// Only [`SessionStore::handle`] creates sessions. Idle sessions expire
/// after `idle_ttl`, and at `max_sessions` the least recently used one is
/// evicted to make room.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Entry>>,
    limits: SessionLimits,
}

impl SessionStore {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            limits,
        }
    }

    fn purge_expired(&self, sessions: &mut HashMap<SessionId, Entry>) {
        let ttl = self.limits.idle_ttl;
        sessions.retain(|id, entry| {
            let keep = entry.last_used.elapsed() < ttl;
            if !keep {
                info!("Expiring idle session {}", id);
            }
            keep
        });
    }

    /// Get the session for `id`, creating an empty one on first use.
    pub async fn handle(&self, id: &SessionId) -> SessionHandle {
        let mut sessions = self.sessions.write().await;
        self.purge_expired(&mut sessions);

        if let Some(entry) = sessions.get_mut(id) {
            entry.last_used = Instant::now();
            return Arc::clone(&entry.handle);
        }

        while sessions.len() >= self.limits.max_sessions {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(oldest) => {
                    info!("Session limit reached, evicting {}", oldest);
                    sessions.remove(&oldest);
                }
                None => break,
            }
        }

        info!("Creating session {}", id);
        let handle: SessionHandle = Arc::new(RwLock::new(Session::new()));
        sessions.insert(
            id.clone(),
            Entry {
                handle: Arc::clone(&handle),
                last_used: Instant::now(),
            },
        );
        handle
    }

    /// Look up an existing session without creating one.
    pub async fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        self.purge_expired(&mut sessions);
        sessions.get_mut(id).map(|entry| {
            entry.last_used = Instant::now();
            Arc::clone(&entry.handle)
        })
    }

    pub async fn remove(&self, id: &SessionId) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            info!("Dropped session {}", id);
        }
        removed
    }

    /// Number of live (non-expired) sessions.
    pub async fn len(&self) -> usize {
        let ttl = self.limits.idle_ttl;
        self.sessions
            .read()
            .await
            .values()
            .filter(|entry| entry.last_used.elapsed() < ttl)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
