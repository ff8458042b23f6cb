//! HTTP routing tests driven through `tower::ServiceExt::oneshot`.

mod common;

use std::sync::atomic::Ordering;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{harness, png_bytes, sample_detections, Harness};
use sam_inpaint::server::{build_router, SESSION_HEADER};

const BOUNDARY: &str = "sam-inpaint-test-boundary";

fn router(h: &Harness) -> Router {
    build_router(h.pipeline.clone(), 10 * 1024 * 1024)
}

fn upload(uri: &str, session: &str, filename: &str, bytes: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"{f}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
            b = BOUNDARY,
            f = filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(SESSION_HEADER, session)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

fn post_json(uri: &str, session: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(SESSION_HEADER, session)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str, session: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(SESSION_HEADER, session)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_and_banners() {
    let h = harness(Default::default(), &[]);
    let app = router(&h);
    for uri in ["/health", "/sam2/", "/grounding-dino/", "/diffusion/"] {
        let response = app.clone().oneshot(get(uri, "s")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{}", uri);
    }
}

#[tokio::test]
async fn test_segment_without_image_is_client_error() {
    let h = harness(Default::default(), &[]);
    let response = router(&h)
        .oneshot(post_json(
            "/sam2/segment",
            "s",
            json!({"normalized_x": 0.5, "normalized_y": 0.5}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["detail"].as_str().unwrap().contains("no image"));
}

#[tokio::test]
async fn test_gif_upload_rejected() {
    let h = harness(Default::default(), &[]);
    let response = router(&h)
        .oneshot(upload("/sam2/add-image", "s", "photo.gif", b"GIF89a"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_corrupt_upload_is_server_error() {
    let h = harness(Default::default(), &[]);
    let response = router(&h)
        .oneshot(upload("/diffusion/set_image", "s", "photo.jpg", b"garbage"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_upload_segment_and_fetch_masks() {
    let h = harness(Default::default(), &[]);
    let app = router(&h);

    let response = app
        .clone()
        .oneshot(upload("/sam2/add-image", "s", "photo.png", &png_bytes(40, 20)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["width"], 40);
    assert_eq!(body["height"], 20);

    let response = app
        .clone()
        .oneshot(post_json(
            "/sam2/segment",
            "s",
            json!({"normalized_x": 0.5, "normalized_y": 0.5, "alpha": 1.0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "image/png");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let overlay = image::load_from_memory(&bytes).unwrap().to_rgb8();
    assert_eq!(overlay.dimensions(), (40, 20));
    assert_eq!(overlay.get_pixel(20, 10).0, [30, 144, 255]);

    let response = app.clone().oneshot(get("/sam2/get_masks", "s")).await.unwrap();
    let masks: Vec<Vec<Vec<u8>>> =
        serde_json::from_value(json_body(response).await).unwrap();
    assert_eq!(masks.len(), 1);
    assert_eq!(masks[0].len(), 20);
    assert_eq!(masks[0][0].len(), 40);
    assert_eq!(masks[0][10][20], 1);

    let response = app
        .oneshot(post_json(
            "/sam2/segment_with_text",
            "s",
            json!({"boxes": [[0.25, 0.5, 0.5, 1.0], [0.75, 0.5, 0.5, 1.0]], "alpha": [0.5, 0.5]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_grounding_dino_predict() {
    let h = harness(sample_detections(), &[]);
    let app = router(&h);
    app.clone()
        .oneshot(upload("/grounding-dino/set_image", "s", "photo.png", &png_bytes(32, 32)))
        .await
        .unwrap();

    let response = app
        .oneshot(post_json(
            "/grounding-dino/predict",
            "s",
            json!({"prompt": "dog", "single_target": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["phrases"], json!(["dog"]));
    assert_eq!(body["logits"].as_array().unwrap().len(), 1);
    assert_eq!(body["boxes"][0].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_inpainting_returns_png_with_score_headers() {
    let h = harness(Default::default(), &[0.1, 0.6]);
    let app = router(&h);
    app.clone()
        .oneshot(upload("/diffusion/set_image", "s", "photo.png", &png_bytes(8, 8)))
        .await
        .unwrap();

    let mask: Vec<Vec<f32>> = (0..8)
        .map(|y| (0..8).map(|x| if x < 4 && y < 4 { 1.0 } else { 0.0 }).collect())
        .collect();
    let response = app
        .oneshot(post_json(
            "/diffusion/inpainting",
            "s",
            json!({
                "prompt": "a bird",
                "mask": mask,
                "num_samples": 2,
                "seed": 7,
                "restore_original_size": true,
                "postprocess_mode": "none",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "image/png");
    assert_eq!(response.headers()["x-clip-score"], "0.6");
    let seed: u64 = response.headers()["x-seed"].to_str().unwrap().parse().unwrap();
    assert_eq!(seed, h.generator.seeds.lock().unwrap()[1]);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let image = image::load_from_memory(&bytes).unwrap();
    assert_eq!((image.width(), image.height()), (8, 8));
}

#[tokio::test]
async fn test_session_lifecycle() {
    let h = harness(Default::default(), &[]);
    let app = router(&h);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sessions")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let id = json_body(response).await["session_id"]
        .as_str()
        .unwrap()
        .to_string();

    app.clone()
        .oneshot(upload("/sam2/add-image", &id, "photo.png", &png_bytes(4, 4)))
        .await
        .unwrap();

    let status = json_body(app.clone().oneshot(get("/sessions/status", &id)).await.unwrap()).await;
    assert_eq!(status["has_image"], true);
    let other = json_body(app.clone().oneshot(get("/sessions/status", "other")).await.unwrap()).await;
    assert_eq!(other["has_image"], false);

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/sessions")
                .header(SESSION_HEADER, id.as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(json_body(response).await["removed"], true);
}

#[tokio::test]
async fn test_invalid_alpha_rejected_before_segmentation() {
    let h = harness(Default::default(), &[]);
    let app = router(&h);
    app.clone()
        .oneshot(upload("/sam2/add-image", "s", "photo.png", &png_bytes(16, 16)))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/sam2/segment",
            "s",
            json!({"normalized_x": 0.5, "normalized_y": 0.5, "alpha": 2.0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(post_json(
            "/sam2/segment_with_text",
            "s",
            json!({"boxes": [[0.5, 0.5, 0.2, 0.2]], "alpha": [0.5, 0.5]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(h.segmenter.calls.load(Ordering::SeqCst), 0);
    let status = json_body(app.oneshot(get("/sessions/status", "s")).await.unwrap()).await;
    assert_eq!(status["mask_count"], 0);
}

#[tokio::test]
async fn test_huge_mask_rescale_keeps_server_alive() {
    let h = harness(Default::default(), &[0.4]);
    let app = router(&h);
    app.clone()
        .oneshot(upload("/diffusion/set_image", "s", "photo.png", &png_bytes(32, 32)))
        .await
        .unwrap();

    let mask: Vec<Vec<f32>> = (0..32)
        .map(|y| {
            (0..32)
                .map(|x| if (8..24).contains(&x) && (8..24).contains(&y) { 1.0 } else { 0.0 })
                .collect()
        })
        .collect();
    let response = app
        .clone()
        .oneshot(post_json(
            "/diffusion/inpainting",
            "s",
            json!({
                "prompt": "a bird",
                "mask": mask,
                "num_samples": 1,
                "mask_rescale": 100000,
                "postprocess_mode": "none",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/health", "s")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_get_detections_returns_latest_prediction() {
    let h = harness(sample_detections(), &[]);
    let app = router(&h);

    let response = app
        .clone()
        .oneshot(get("/grounding-dino/get_detections", "s"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.clone()
        .oneshot(upload("/grounding-dino/set_image", "s", "photo.png", &png_bytes(32, 32)))
        .await
        .unwrap();
    let body = json_body(
        app.clone()
            .oneshot(get("/grounding-dino/get_detections", "s"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["phrases"], json!([]));

    app.clone()
        .oneshot(post_json(
            "/grounding-dino/predict",
            "s",
            json!({"prompt": "dog"}),
        ))
        .await
        .unwrap();
    let body = json_body(
        app.oneshot(get("/grounding-dino/get_detections", "s"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["phrases"], json!(sample_detections().phrases));
}

#[tokio::test]
async fn test_read_only_routes_do_not_create_sessions() {
    let h = harness(Default::default(), &[]);
    let app = router(&h);
    for n in 0..5 {
        let id = format!("visitor-{}", n);
        for uri in [
            "/sessions/status",
            "/sam2/get_masks",
            "/grounding-dino/get_detections",
        ] {
            app.clone().oneshot(get(uri, &id)).await.unwrap();
        }
        app.clone()
            .oneshot(post_json(
                "/sam2/segment",
                &id,
                json!({"normalized_x": 0.5, "normalized_y": 0.5}),
            ))
            .await
            .unwrap();
    }
    assert!(h.pipeline.sessions().is_empty().await);
}
