//! Error taxonomy shared by every orchestrator and the HTTP layer.

use std::time::Duration;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = EditError> = std::result::Result<T, E>;

/// Failures an editing session can surface to a caller.
#[derive(Debug, Error)]
pub enum EditError {
    /// The operation needs a staged image and the session has none.
    #[error("no image has been set for this session")]
    NoImage,

    /// Uploaded bytes are not a decodable raster image.
    #[error("failed to decode image: {0}")]
    Decode(String),

    /// Upload rejected on its file name before any decode attempt.
    #[error("invalid image format: {0}")]
    InvalidFormat(String),

    /// A mask or image does not have the expected spatial extent.
    #[error("dimension mismatch: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    /// A numeric parameter is out of range or inconsistent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The session image changed while inference was running.
    #[error("session image was replaced while inference was running")]
    ImageReplaced,

    /// Inference did not finish before the request deadline.
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),

    /// The opaque model collaborator failed.
    #[error("model backend failed: {0:#}")]
    Backend(#[from] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EditError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        EditError::InvalidArgument(msg.into())
    }
}

impl From<image::ImageError> for EditError {
    fn from(err: image::ImageError) -> Self {
        EditError::Decode(err.to_string())
    }
}
