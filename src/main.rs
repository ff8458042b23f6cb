//! sam-inpaint server - segmentation, detection and inpainting over HTTP

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use sam_inpaint::cli::{get_log_level, Cli, LogFormat};
use sam_inpaint::models::{RemoteDetector, RemoteGenerator, RemoteScorer, RemoteSegmenter};
use sam_inpaint::pipeline::{Backends, EditPipeline};
use sam_inpaint::server::{build_router, serve};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = get_log_level(cli.verbose);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    match cli.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    tracing::info!("sam-inpaint server starting");

    // Blocking HTTP clients must be created outside the async runtime.
    let timeout = cli.backend_timeout();
    let backends = Backends {
        segmentation: Arc::new(
            RemoteSegmenter::new(&cli.segmentation_url, timeout)
                .context("Failed to create segmentation client")?,
        ),
        detection: Arc::new(
            RemoteDetector::new(&cli.detection_url, timeout)
                .context("Failed to create detection client")?,
        ),
        generator: Arc::new(
            RemoteGenerator::new(&cli.inpainting_url, timeout)
                .context("Failed to create inpainting client")?,
        ),
        scorer: Arc::new(
            RemoteScorer::new(&cli.clip_url, timeout).context("Failed to create CLIP client")?,
        ),
    };
    let pipeline = Arc::new(
        EditPipeline::new(backends, &cli.service_config())
            .context("Invalid service configuration")?,
    );
    let router = build_router(Arc::clone(&pipeline), cli.max_upload_bytes());
    let addr = cli.bind_addr()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;
    let served = runtime.block_on(serve(router, addr));
    // The blocking clients inside the pipeline must be dropped off the runtime.
    drop(runtime);
    drop(pipeline);
    served?;

    tracing::info!("Server stopped");
    Ok(())
}
