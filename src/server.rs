//! HTTP surface for the interactive editing frontend.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::error::{EditError, Result};
use crate::inpainting::InpaintOptions;
use crate::models::preprocessing::encode_png;
use crate::pipeline::{EditPipeline, PromptOutcome};
use crate::segmentation::Alphas;
use crate::session::{SessionId, SessionStatus};
use crate::types::{CenterBox, DetectionSet, Mask, NestedMask, PointLabel, Prompt};

/// Header clients use to pick their session.
pub const SESSION_HEADER: &str = "x-session-id";
/// Multipart field carrying the uploaded image.
pub const UPLOAD_FIELD: &str = "image";

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<EditPipeline>,
}

impl IntoResponse for EditError {
    fn into_response(self) -> Response {
        let status = match &self {
            EditError::NoImage
            | EditError::InvalidFormat(_)
            | EditError::InvalidArgument(_)
            | EditError::DimensionMismatch { .. } => StatusCode::BAD_REQUEST,
            EditError::ImageReplaced => StatusCode::CONFLICT,
            EditError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EditError::Decode(_) | EditError::Backend(_) | EditError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected: {}", self);
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

fn session_id(headers: &HeaderMap) -> SessionId {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(SessionId::new)
        .unwrap_or_default()
}

fn png_response(image: &image::RgbImage) -> Result<Response> {
    let bytes = encode_png(image).map_err(|e| EditError::Internal(format!("{:#}", e)))?;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}

/// Pull the image field out of a multipart upload.
async fn read_upload(mut multipart: Multipart) -> Result<(String, Vec<u8>)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| EditError::invalid(format!("malformed multipart body: {}", e)))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| EditError::invalid(format!("failed to read upload: {}", e)))?;
        return Ok((filename, bytes.to_vec()));
    }
    Err(EditError::invalid(format!(
        "multipart field '{}' is missing",
        UPLOAD_FIELD
    )))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn banner(name: &'static str) -> Json<serde_json::Value> {
    Json(json!({ "message": format!("{} endpoints are available", name) }))
}

async fn create_session(State(state): State<AppState>) -> Json<serde_json::Value> {
    let id = state.pipeline.create_session().await;
    Json(json!({ "session_id": id }))
}

async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    let id = session_id(&headers);
    let removed = state.pipeline.drop_session(&id).await;
    Json(json!({ "session_id": id, "removed": removed }))
}

async fn session_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<SessionStatus> {
    Json(state.pipeline.status(&session_id(&headers)).await)
}

async fn set_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>> {
    let id = session_id(&headers);
    let (filename, bytes) = read_upload(multipart).await?;
    let status = state.pipeline.set_image(&id, &filename, &bytes).await?;
    Ok(Json(json!({
        "message": "Image set successfully",
        "session_id": status.session_id,
        "width": status.width,
        "height": status.height,
    })))
}

#[derive(Debug, Deserialize)]
struct PointRequest {
    normalized_x: f32,
    normalized_y: f32,
    #[serde(default)]
    label: PointLabel,
    #[serde(default)]
    alpha: Alphas,
}

async fn segment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PointRequest>,
) -> Result<Response> {
    let id = session_id(&headers);
    let alphas = req.alpha.resolve(1)?;
    let prompt = Prompt::Point {
        x: req.normalized_x,
        y: req.normalized_y,
        label: req.label,
    };
    render_overlay(state.pipeline.prompt(&id, prompt).await?, &alphas)
}

#[derive(Debug, Deserialize)]
struct BoxesRequest {
    boxes: Vec<[f32; 4]>,
    #[serde(default)]
    alpha: Alphas,
}

async fn segment_with_boxes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BoxesRequest>,
) -> Result<Response> {
    let id = session_id(&headers);
    let alphas = req.alpha.resolve(req.boxes.len())?;
    let boxes = req.boxes.into_iter().map(CenterBox::from).collect();
    render_overlay(
        state.pipeline.prompt(&id, Prompt::BoxSet(boxes)).await?,
        &alphas,
    )
}

fn render_overlay(outcome: PromptOutcome, alphas: &[f32]) -> Result<Response> {
    match outcome {
        PromptOutcome::Masks(segmentation) => png_response(&segmentation.overlay(alphas)?),
        PromptOutcome::Detections(_) => Err(EditError::Internal(
            "segmentation prompt produced detections".to_string(),
        )),
    }
}

async fn get_masks(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Vec<Vec<u8>>>>> {
    let masks = state.pipeline.masks(&session_id(&headers)).await?;
    Ok(Json(masks.iter().map(Mask::to_nested).collect()))
}

#[derive(Debug, Deserialize)]
struct DetectRequest {
    prompt: String,
    #[serde(default)]
    single_target: bool,
}

#[derive(Debug, Serialize)]
struct DetectResponse {
    boxes: Vec<[f32; 4]>,
    logits: Vec<f32>,
    phrases: Vec<String>,
}

impl From<DetectionSet> for DetectResponse {
    fn from(set: DetectionSet) -> Self {
        Self {
            boxes: set.boxes.iter().map(CenterBox::to_array).collect(),
            logits: set.scores,
            phrases: set.phrases,
        }
    }
}

async fn detect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DetectRequest>,
) -> Result<Json<DetectResponse>> {
    let id = session_id(&headers);
    let prompt = Prompt::Text {
        prompt: req.prompt,
        single_target: req.single_target,
    };
    match state.pipeline.prompt(&id, prompt).await? {
        PromptOutcome::Detections(set) => Ok(Json(set.into())),
        PromptOutcome::Masks(_) => Err(EditError::Internal(
            "text prompt produced masks".to_string(),
        )),
    }
}

async fn get_detections(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DetectResponse>> {
    let detections = state.pipeline.detections(&session_id(&headers)).await?;
    Ok(Json(detections.into()))
}

#[derive(Debug, Deserialize)]
struct InpaintRequest {
    prompt: String,
    #[serde(default)]
    mask: Option<NestedMask>,
    #[serde(flatten)]
    options: InpaintOptions,
}

async fn inpaint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InpaintRequest>,
) -> Result<Response> {
    let id = session_id(&headers);
    let mask = req.mask.as_ref().map(Mask::from_nested).transpose()?;
    let result = state
        .pipeline
        .inpaint(&id, mask, &req.prompt, &req.options)
        .await?;
    info!(
        "Selected candidate with score {:.4} (seed {}) out of {:?}",
        result.clip_score, result.seed, result.candidate_scores
    );

    let bytes = encode_png(&result.image).map_err(|e| EditError::Internal(format!("{:#}", e)))?;
    Ok((
        [
            ("content-type", "image/png".to_string()),
            ("x-clip-score", result.clip_score.to_string()),
            ("x-seed", result.seed.to_string()),
        ],
        bytes,
    )
        .into_response())
}

/// Build the application router around a shared pipeline.
pub fn build_router(pipeline: Arc<EditPipeline>, max_upload_bytes: usize) -> Router {
    let state = AppState { pipeline };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let sam2 = Router::new()
        .route("/", get(|| banner("SAM2 segmentation")))
        .route("/add-image", post(set_image))
        .route("/segment", post(segment))
        .route("/segment_with_text", post(segment_with_boxes))
        .route("/get_masks", get(get_masks));

    let grounding_dino = Router::new()
        .route("/", get(|| banner("GroundingDINO detection")))
        .route("/set_image", post(set_image))
        .route("/predict", post(detect))
        .route("/get_detections", get(get_detections));

    let diffusion = Router::new()
        .route("/", get(|| banner("Diffusion inpainting")))
        .route("/set_image", post(set_image))
        .route("/inpainting", post(inpaint));

    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(create_session).delete(delete_session))
        .route("/sessions/status", get(session_status))
        .nest("/sam2", sam2)
        .nest("/grounding-dino", grounding_dino)
        .nest("/diffusion", diffusion)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `router` until ctrl-c.
pub async fn serve(router: Router, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        })
        .await?;
    Ok(())
}
