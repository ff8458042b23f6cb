//! Command-line interface for the sam-inpaint server.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::config::{DetectionThresholds, ServiceConfig};

/// sam-inpaint - point, box and text driven image editing over HTTP
#[derive(Parser, Debug)]
#[command(
    name = "sam-inpaint",
    about = "Segmentation, open-vocabulary detection and inpainting server",
    version,
    author
)]
pub struct Cli {
    /// Address to bind
    #[arg(long, env = "SAM_INPAINT_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "SAM_INPAINT_PORT", default_value = "8000")]
    pub port: u16,

    /// Segmentation model server
    #[arg(
        long,
        env = "SAM_INPAINT_SEGMENTATION_URL",
        default_value = "http://localhost:9001",
        value_name = "URL"
    )]
    pub segmentation_url: String,

    /// Open-vocabulary detection model server
    #[arg(
        long,
        env = "SAM_INPAINT_DETECTION_URL",
        default_value = "http://localhost:9002",
        value_name = "URL"
    )]
    pub detection_url: String,

    /// Diffusion inpainting model server
    #[arg(
        long,
        env = "SAM_INPAINT_INPAINTING_URL",
        default_value = "http://localhost:9003",
        value_name = "URL"
    )]
    pub inpainting_url: String,

    /// Image-text similarity model server
    #[arg(
        long,
        env = "SAM_INPAINT_CLIP_URL",
        default_value = "http://localhost:9004",
        value_name = "URL"
    )]
    pub clip_url: String,

    /// Minimum box confidence kept by the detector
    #[arg(long, env = "SAM_INPAINT_BOX_THRESHOLD", default_value = "0.35")]
    pub box_threshold: f32,

    /// Minimum phrase confidence kept by the detector
    #[arg(long, env = "SAM_INPAINT_TEXT_THRESHOLD", default_value = "0.25")]
    pub text_threshold: f32,

    /// Square resolution the inpainting model works at
    #[arg(long, env = "SAM_INPAINT_WORKING_SIZE", default_value = "1024", value_name = "PX")]
    pub working_size: u32,

    /// Per-request inference deadline
    #[arg(
        long,
        env = "SAM_INPAINT_INFERENCE_TIMEOUT_SECS",
        default_value = "300",
        value_name = "SECS"
    )]
    pub inference_timeout_secs: u64,

    /// Model calls allowed to run at once
    #[arg(long, env = "SAM_INPAINT_MAX_CONCURRENT_INFERENCES", default_value = "1")]
    pub max_concurrent_inferences: usize,

    /// Sessions kept before the least recently used one is evicted
    #[arg(long, env = "SAM_INPAINT_MAX_SESSIONS", default_value = "64")]
    pub max_sessions: usize,

    /// Drop sessions idle for longer than this
    #[arg(
        long,
        env = "SAM_INPAINT_SESSION_IDLE_TTL_SECS",
        default_value = "3600",
        value_name = "SECS"
    )]
    pub session_idle_ttl_secs: u64,

    /// HTTP timeout for calls to the model servers
    #[arg(
        long,
        env = "SAM_INPAINT_BACKEND_TIMEOUT_SECS",
        default_value = "600",
        value_name = "SECS"
    )]
    pub backend_timeout_secs: u64,

    /// Largest accepted request body
    #[arg(long, env = "SAM_INPAINT_MAX_UPLOAD_MB", default_value = "50", value_name = "MB")]
    pub max_upload_mb: usize,

    /// Log output format
    #[arg(long, env = "SAM_INPAINT_LOG_FORMAT", default_value = "text", value_name = "FORMAT")]
    pub log_format: LogFormat,

    /// Verbose logging (can be repeated: -v, -vv)
    #[arg(short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            detection: DetectionThresholds {
                box_threshold: self.box_threshold,
                text_threshold: self.text_threshold,
            },
            working_size: self.working_size,
            inference_timeout: Duration::from_secs(self.inference_timeout_secs),
            max_concurrent_inferences: self.max_concurrent_inferences,
            max_sessions: self.max_sessions,
            session_idle_ttl: Duration::from_secs(self.session_idle_ttl_secs),
        }
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address {}: {}", addr, e))
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            _ => Err(format!("Unknown format: {}. Use 'json' or 'text'", s)),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Json => write!(f, "json"),
            LogFormat::Text => write!(f, "text"),
        }
    }
}

/// Get tracing level from verbosity
pub fn get_log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}
