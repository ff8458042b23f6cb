#![doc = include_str!("../README.md")]

pub mod cli;
pub mod config;
pub mod detection;
pub mod error;
pub mod geometry;
pub mod inpainting;
pub mod models;
pub mod pipeline;
pub mod segmentation;
pub mod server;
pub mod session;
pub mod types;
pub mod worker;

pub use error::{EditError, Result};
pub use pipeline::{Backends, EditPipeline, PromptOutcome};
pub use types::{CenterBox, DetectionSet, InpaintingResult, Mask, PointLabel, Prompt};
