use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use easel_core::request::{ControlTypeInfo, TextToImageRequest};
use easel_core::{Engine, Loader};

use crate::codec::decode_image;
use crate::error::{ApiError, ApiJson};
use crate::wire::{
    ControlNetRequest, FaceRestoreRequest, HealthResponse, ImageResponse, Img2ImgUpscaleRequest,
    InpaintRequest, OutpaintRequest, PreprocessRequest, TraditionalUpscaleRequest, UpscaleRequest,
};

type AppState<L> = State<Arc<Engine<L>>>;
type ImageResult = Result<Json<ImageResponse>, ApiError>;

pub fn router<L: Loader>(engine: Arc<Engine<L>>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health::<L>))
        .route("/text-to-image", post(text_to_image::<L>))
        .route(
            "/controlnet/types",
            get(controlnet_types::<L>).post(controlnet_types::<L>),
        )
        .route("/controlnet/preprocess", post(controlnet_preprocess::<L>))
        .route("/controlnet/generate", post(controlnet_generate::<L>))
        .route("/inpaint", post(inpaint::<L>))
        .route("/outpaint", post(outpaint::<L>))
        .route("/upscale", post(upscale::<L>))
        .route("/upscale/traditional", post(traditional_upscale::<L>))
        .route("/upscale/img2img", post(img2img_upscale::<L>))
        .route("/face-restore", post(face_restore::<L>))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(engine)
}

fn respond(image: image::DynamicImage) -> ImageResult {
    Ok(Json(ImageResponse::png(&image)?))
}

async fn health<L: Loader>(State(engine): AppState<L>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        device: engine.device_label(),
        loaded: engine.loaded_count(),
    })
}

async fn text_to_image<L: Loader>(
    State(engine): AppState<L>,
    ApiJson(req): ApiJson<TextToImageRequest>,
) -> ImageResult {
    respond(engine.text_to_image(req).await?)
}

async fn controlnet_types<L: Loader>(State(engine): AppState<L>) -> Json<Vec<ControlTypeInfo>> {
    Json(engine.controlnet_types())
}

async fn controlnet_preprocess<L: Loader>(
    State(engine): AppState<L>,
    ApiJson(req): ApiJson<PreprocessRequest>,
) -> ImageResult {
    let image = decode_image("image", &req.image)?;
    respond(engine.controlnet_preprocess(image, req.params).await?)
}

async fn controlnet_generate<L: Loader>(
    State(engine): AppState<L>,
    ApiJson(req): ApiJson<ControlNetRequest>,
) -> ImageResult {
    let control_image = decode_image("control_image", &req.control_image)?;
    respond(engine.controlnet_generate(control_image, req.params).await?)
}

async fn inpaint<L: Loader>(
    State(engine): AppState<L>,
    ApiJson(req): ApiJson<InpaintRequest>,
) -> ImageResult {
    let image = decode_image("image", &req.image)?;
    let mask = decode_image("mask", &req.mask)?;
    respond(engine.inpaint(image, mask, req.params).await?)
}

async fn outpaint<L: Loader>(
    State(engine): AppState<L>,
    ApiJson(req): ApiJson<OutpaintRequest>,
) -> ImageResult {
    let image = decode_image("image", &req.image)?;
    respond(engine.outpaint(image, req.params).await?)
}

async fn upscale<L: Loader>(
    State(engine): AppState<L>,
    ApiJson(req): ApiJson<UpscaleRequest>,
) -> ImageResult {
    let image = decode_image("image", &req.image)?;
    respond(engine.upscale(image, req.params).await?)
}

async fn traditional_upscale<L: Loader>(
    State(engine): AppState<L>,
    ApiJson(req): ApiJson<TraditionalUpscaleRequest>,
) -> ImageResult {
    let image = decode_image("image", &req.image)?;
    respond(engine.traditional_upscale(image, req.params).await?)
}

async fn img2img_upscale<L: Loader>(
    State(engine): AppState<L>,
    ApiJson(req): ApiJson<Img2ImgUpscaleRequest>,
) -> ImageResult {
    let image = decode_image("image", &req.image)?;
    respond(engine.img2img_upscale(image, req.params).await?)
}

async fn face_restore<L: Loader>(
    State(engine): AppState<L>,
    ApiJson(req): ApiJson<FaceRestoreRequest>,
) -> ImageResult {
    let image = decode_image("image", &req.image)?;
    respond(engine.face_restore(image, req.params).await?)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use easel_core::testing::CountingLoader;
    use easel_core::Device;
    use image::DynamicImage;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::codec::image_to_base64_png;

    fn app() -> (Router, Arc<Engine<CountingLoader>>) {
        let engine = Arc::new(Engine::new(CountingLoader::new(), Device::Cpu));
        (router(engine.clone(), 16 * 1024 * 1024), engine)
    }

    fn png(width: u32, height: u32) -> String {
        image_to_base64_png(&DynamicImage::new_rgb8(width, height)).unwrap()
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn health_reports_device_and_loaded_count() {
        let (app, _) = app();
        let (status, body) = call(app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok", "device": "cpu", "loaded": 0}));
    }

    #[tokio::test]
    async fn text_to_image_returns_png() {
        let (app, engine) = app();
        let body = json!({
            "model_id": "runwayml/stable-diffusion-v1-5",
            "prompt": "a lighthouse",
            "width": 48,
            "height": 32,
            "seed": 7
        });
        let (status, body) = call(app, "POST", "/text-to-image", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["width"], 48);
        assert_eq!(body["height"], 32);
        assert_eq!(body["format"], "png");
        assert_eq!(engine.loaded_count(), 1);
    }

    #[tokio::test]
    async fn traditional_upscale_doubles_the_image() {
        let (app, _) = app();
        for method in ["nearest", "bilinear", "bicubic", "lanczos", "area"] {
            let body = json!({"image": png(100, 100), "method": method, "factor": 2});
            let (status, body) = call(app.clone(), "POST", "/upscale/traditional", Some(body)).await;
            assert_eq!(status, StatusCode::OK, "{method}");
            assert_eq!((body["width"].as_u64(), body["height"].as_u64()), (Some(200), Some(200)));
        }
    }

    #[tokio::test]
    async fn invalid_enum_values_are_bad_requests() {
        let (app, engine) = app();
        let body = json!({"image": png(4, 4), "model": "realesrgan", "factor": 3});
        let (status, body) = call(app.clone(), "POST", "/upscale", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_body");
        assert_eq!(engine.loader().counts.upscaler.load(Ordering::SeqCst), 0);

        let body = json!({"image": png(4, 4), "method": "sinc"});
        let (status, _) = call(app, "POST", "/upscale/traditional", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let (app, _) = app();
        let request = Request::builder()
            .method("POST")
            .uri("/text-to-image")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn undecodable_images_are_bad_requests() {
        let (app, _) = app();
        let body = json!({"image": "not base64!", "factor": 2});
        let (status, body) = call(app, "POST", "/upscale", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_image");
    }

    #[tokio::test]
    async fn face_restore_is_not_implemented_without_backend() {
        let (app, engine) = app();
        let body = json!({"image": png(8, 8)});
        let (status, body) = call(app, "POST", "/face-restore", Some(body)).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(body["error"], "not_implemented");
        assert_eq!(engine.loader().counts.face_restorer.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn load_failures_are_server_errors() {
        let (app, _) = app();
        let body = json!({"model_id": "stabilityai/stable-diffusion-3-medium", "prompt": "x"});
        let (status, body) = call(app, "POST", "/text-to-image", Some(body)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "load");
    }

    #[tokio::test]
    async fn outpaint_grows_the_canvas() {
        let (app, _) = app();
        let body = json!({
            "image": png(64, 64),
            "direction": "left",
            "pixels": 32,
            "prompt": "forest"
        });
        let (status, body) = call(app, "POST", "/outpaint", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!((body["width"].as_u64(), body["height"].as_u64()), (Some(96), Some(64)));
    }

    #[tokio::test]
    async fn controlnet_types_on_get_and_post() {
        let (app, _) = app();
        for method in ["GET", "POST"] {
            let (status, body) = call(app.clone(), method, "/controlnet/types", None).await;
            assert_eq!(status, StatusCode::OK);
            let types: Vec<&str> = body
                .as_array()
                .unwrap()
                .iter()
                .map(|t| t["type"].as_str().unwrap())
                .collect();
            assert_eq!(types, vec!["canny", "softedge", "scribble", "tile"]);
        }
    }

    #[tokio::test]
    async fn controlnet_generate_and_preprocess() {
        let (app, engine) = app();
        let body = json!({"image": png(40, 30), "control_type": "canny"});
        let (status, body) = call(app.clone(), "POST", "/controlnet/preprocess", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["width"], 40);

        let body = json!({
            "control_image": png(40, 30),
            "base_model_id": "runwayml/stable-diffusion-v1-5",
            "control_type": "tile",
            "prompt": "a street"
        });
        let (status, _) = call(app.clone(), "POST", "/controlnet/generate", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(engine.loader().counts.controlnet.load(Ordering::SeqCst), 1);

        let body = json!({"image": png(4, 4), "control_type": "depth"});
        let (status, _) = call(app, "POST", "/controlnet/preprocess", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
