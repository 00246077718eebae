//! Actix Web server exposing the detection API under `/api/v1`.
//!
//! Uploads and batch jobs run on the blocking pool; WebSocket connections are
//! adapted to [`LiveChannel`] and driven by a [`LiveSession`] on the worker's
//! local task set.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer, ResponseError,
    http::{StatusCode, header},
    web::{self, Bytes},
};
use actix_ws::AggregatedMessage;
use anyhow::{Context, Result};
use futures_util::StreamExt;
use ml_core::{Detector, SettingsUpdate, SharedSettings};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};
use video_io::SourceLocator;

use crate::vision::{
    config::ServerConfig,
    encoding::{decode_image_bytes, encode_jpeg},
    envelope::{Envelope, WireDetection},
    live::{ChannelError, Inbound, LiveChannel, LiveSession},
    pipeline::{PipelineError, PipelineJob},
    telemetry,
    uploads::{StoredUpload, UploadStore, with_extension},
};

const CAMERA_OUTPUT: &str = "camera_output.mp4";

/// Shared state backing HTTP handlers.
pub struct AppState {
    detector: Arc<dyn Detector>,
    settings: SharedSettings,
    uploads: UploadStore,
    live: LiveSession,
    jpeg_quality: u8,
    settings_refresh_frames: u32,
    camera_frame_limit: u64,
    max_message_bytes: usize,
    camera_busy: AtomicBool,
}

impl AppState {
    /// Create the upload layout and seed the shared settings.
    pub fn new(config: &ServerConfig, detector: Arc<dyn Detector>) -> Result<Self> {
        let uploads = UploadStore::create(&config.upload_dir)
            .with_context(|| format!("failed to create {}", config.upload_dir.display()))?;
        let settings = SharedSettings::new(config.detector.settings.clone())?;
        let live = LiveSession::new(
            detector.clone(),
            settings.clone(),
            config.live.clone(),
            uploads.root(),
        );
        Ok(Self {
            detector,
            settings,
            uploads,
            live,
            jpeg_quality: config.live.jpeg_quality,
            settings_refresh_frames: config.settings_refresh_frames,
            camera_frame_limit: config.camera_frame_limit,
            max_message_bytes: config.live.max_message_bytes,
            camera_busy: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "detail": self.to_string() }))
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<actix_web::error::BlockingError> for ApiError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        ApiError::Internal(format!("worker pool unavailable: {err}"))
    }
}

/// Register every route. Shared by the real server and tests.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/detect/image", web::post().to(detect_image))
            .route("/detect/video", web::post().to(detect_video))
            .route("/detect/camera", web::post().to(detect_camera))
            .route("/settings", web::post().to(update_settings))
            .route("/video/ws/video", web::get().to(relay_socket))
            .route("/video/ws/upload", web::get().to(upload_socket)),
    )
    .route("/metrics", web::get().to(metrics_route));
}

/// Bind and serve until the server is stopped.
pub async fn run(config: ServerConfig, detector: Arc<dyn Detector>) -> Result<()> {
    telemetry::init_metrics_recorder();
    let state = web::Data::new(AppState::new(&config, detector)?);
    let max_upload = config.max_upload_bytes;

    info!(
        bind = %config.bind,
        port = config.port,
        upload_dir = %config.upload_dir.display(),
        "starting detection API"
    );
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(web::PayloadConfig::new(max_upload))
            .configure(routes)
    })
    .bind((config.bind, config.port))
    .with_context(|| format!("failed to bind {}:{}", config.bind, config.port))?
    .run()
    .await
    .context("HTTP server error")
}

#[derive(Deserialize)]
struct UploadQuery {
    filename: Option<String>,
}

#[derive(Deserialize)]
struct CameraQuery {
    device: Option<u32>,
    max_frames: Option<u64>,
}

fn require_content_type(req: &HttpRequest, prefix: &str, message: &str) -> Result<(), ApiError> {
    let matches = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with(prefix));
    if matches {
        Ok(())
    } else {
        Err(ApiError::BadRequest(message.into()))
    }
}

/// Sets the job's cancel flag when the request future is dropped.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Exclusive claim on the camera output.
struct CameraLease(web::Data<AppState>);

impl CameraLease {
    fn acquire(state: &web::Data<AppState>) -> Option<Self> {
        state
            .camera_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CameraLease(state.clone()))
    }
}

impl Drop for CameraLease {
    fn drop(&mut self) {
        self.0.camera_busy.store(false, Ordering::Release);
    }
}

async fn detect_image(
    req: HttpRequest,
    query: web::Query<UploadQuery>,
    body: Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    require_content_type(&req, "image/", "please upload an image file")?;
    if body.is_empty() {
        return Err(ApiError::BadRequest("empty upload".into()));
    }
    let upload = state
        .uploads
        .save(query.filename.as_deref(), "image.jpg", &body)
        .map_err(|err| ApiError::Internal(format!("failed to store upload: {err}")))?;

    let result_name = with_extension(&upload.name, "jpg");
    let result_path = state.uploads.result_path(&result_name);
    let detector = state.detector.clone();
    let settings = state.settings.snapshot();
    let quality = state.jpeg_quality;
    let stored = upload.clone();
    let outcome = web::block(move || -> Result<Vec<WireDetection>, ApiError> {
        let bytes = std::fs::read(&stored.path).map_err(|err| ApiError::Internal(err.to_string()))?;
        let frame = decode_image_bytes(&bytes).map_err(ApiError::BadRequest)?;
        let inference = detector
            .infer(&frame, &settings)
            .map_err(|err| ApiError::Internal(format!("detection failed: {err:#}")))?;
        let jpeg = encode_jpeg(&inference.annotated, quality).map_err(|err| ApiError::Internal(err.to_string()))?;
        std::fs::write(&result_path, jpeg).map_err(|err| ApiError::Internal(err.to_string()))?;
        Ok(inference.detections.iter().map(WireDetection::from).collect())
    })
    .await
    .map_err(ApiError::from)
    .and_then(|inner| inner);

    match outcome {
        Ok(detections) => Ok(HttpResponse::Ok().json(json!({
            "detections": detections,
            "result_image": UploadStore::result_ref(&result_name),
        }))),
        Err(err) => {
            discard_upload(&state.uploads, &upload, &err);
            Err(err)
        }
    }
}

async fn detect_video(
    req: HttpRequest,
    query: web::Query<UploadQuery>,
    body: Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    require_content_type(&req, "video/", "please upload a video file")?;
    if body.is_empty() {
        return Err(ApiError::BadRequest("empty upload".into()));
    }
    let upload = state
        .uploads
        .save(query.filename.as_deref(), "video.mp4", &body)
        .map_err(|err| ApiError::Internal(format!("failed to store upload: {err}")))?;

    let result_name = with_extension(&upload.name, "mp4");
    let output = state.uploads.result_path(&result_name);
    let cancel = Arc::new(AtomicBool::new(false));
    let _cancel_guard = CancelOnDrop(cancel.clone());
    let detector = state.detector.clone();
    let view = state.settings.view(state.settings_refresh_frames);
    let source = SourceLocator::file(&upload.path);
    let outcome = web::block(move || {
        PipelineJob::new(source, output, view)
            .with_cancel_flag(cancel)
            .run(detector.as_ref())
    })
    .await
    .map_err(ApiError::from)
    .and_then(|inner| inner.map_err(ApiError::from));

    match outcome {
        Ok(summary) => Ok(HttpResponse::Ok().json(json!({
            "output_path": UploadStore::result_ref(&result_name),
            "size_bytes": summary.size_bytes,
            "frames": summary.frames_written,
            "detections": summary.detections,
        }))),
        Err(err) => {
            discard_upload(&state.uploads, &upload, &err);
            Err(err)
        }
    }
}

async fn detect_camera(
    query: web::Query<CameraQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let frame_limit = query
        .max_frames
        .unwrap_or(state.camera_frame_limit)
        .min(state.camera_frame_limit);
    if frame_limit == 0 {
        return Err(ApiError::BadRequest("max_frames must be at least 1".into()));
    }
    let lease = CameraLease::acquire(&state)
        .ok_or_else(|| ApiError::Conflict("a camera job is already running".into()))?;

    let cancel = Arc::new(AtomicBool::new(false));
    let _cancel_guard = CancelOnDrop(cancel.clone());
    let detector = state.detector.clone();
    let view = state.settings.view(state.settings_refresh_frames);
    let source = SourceLocator::Camera(query.device.unwrap_or(0));
    let output = state.uploads.result_path(CAMERA_OUTPUT);
    let summary = web::block(move || {
        let _lease = lease;
        PipelineJob::new(source, output, view)
            .with_frame_limit(Some(frame_limit))
            .with_cancel_flag(cancel)
            .run(detector.as_ref())
    })
    .await??;

    Ok(HttpResponse::Ok().json(json!({
        "output_path": UploadStore::result_ref(CAMERA_OUTPUT),
        "size_bytes": summary.size_bytes,
        "frames": summary.frames_written,
    })))
}

async fn update_settings(
    update: web::Json<SettingsUpdate>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let update = update.into_inner();
    let candidate = state
        .settings
        .snapshot()
        .merged(&update)
        .map_err(|err| ApiError::Unprocessable(err.to_string()))?;

    let detector = state.detector.clone();
    web::block(move || detector.configure(&candidate))
        .await?
        .map_err(|err| ApiError::Internal(format!("failed to apply settings: {err:#}")))?;

    let applied = state
        .settings
        .apply(&update)
        .map_err(|err| ApiError::Unprocessable(err.to_string()))?;
    info!(
        confidence = applied.confidence_threshold,
        iou = applied.iou_threshold,
        device = %applied.device,
        half = applied.half,
        "detection settings updated"
    );
    Ok(HttpResponse::Ok().json(json!({ "message": "settings updated", "settings": applied })))
}

async fn metrics_route() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().finish(),
    }
}

fn discard_upload(uploads: &UploadStore, upload: &StoredUpload, err: &ApiError) {
    match err {
        ApiError::Internal(reason) => error!(upload = %upload.name, "request failed: {reason}"),
        other => warn!(upload = %upload.name, "request rejected: {other}"),
    }
    uploads.discard(upload);
}

/// Frame relay: one reply per inbound image.
async fn relay_socket(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let (response, channel) = WsChannel::upgrade(&req, body, state.max_message_bytes)?;
    let live = state.live.clone();
    actix_web::rt::spawn(async move {
        let mut channel = channel;
        live.relay(&mut channel).await;
        channel.close().await;
    });
    Ok(response)
}

/// Video ingestion: one uploaded video streamed back frame by frame.
async fn upload_socket(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let (response, channel) = WsChannel::upgrade(&req, body, state.max_message_bytes)?;
    let live = state.live.clone();
    actix_web::rt::spawn(async move {
        let mut channel = channel;
        live.ingest(&mut channel).await;
        channel.close().await;
    });
    Ok(response)
}

/// [`LiveChannel`] over an actix WebSocket.
struct WsChannel {
    session: actix_ws::Session,
    stream: actix_ws::AggregatedMessageStream,
}

impl WsChannel {
    fn upgrade(
        req: &HttpRequest,
        body: web::Payload,
        max_message_bytes: usize,
    ) -> Result<(HttpResponse, Self), actix_web::Error> {
        let (response, session, stream) = actix_ws::handle(req, body)?;
        let stream = stream
            .max_frame_size(max_message_bytes)
            .aggregate_continuations()
            .max_continuation_size(max_message_bytes);
        Ok((response, Self { session, stream }))
    }

    async fn close(self) {
        let _ = self.session.close(None).await;
    }
}

impl LiveChannel for WsChannel {
    async fn recv(&mut self) -> Result<Option<Inbound>, ChannelError> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(AggregatedMessage::Text(text)) => return Ok(Some(Inbound::Text(text.to_string()))),
                Ok(AggregatedMessage::Binary(bytes)) => return Ok(Some(Inbound::Binary(bytes.to_vec()))),
                Ok(AggregatedMessage::Ping(bytes)) => {
                    self.session
                        .pong(&bytes)
                        .await
                        .map_err(|_| ChannelError::Disconnected)?;
                }
                Ok(AggregatedMessage::Pong(_)) => {}
                Ok(AggregatedMessage::Close(_)) => return Ok(None),
                Err(err) => return Err(ChannelError::Transport(err.to_string())),
            }
        }
        Ok(None)
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), ChannelError> {
        let text = serde_json::to_string(envelope).map_err(|err| ChannelError::Transport(err.to_string()))?;
        self.session
            .text(text)
            .await
            .map_err(|_| ChannelError::Disconnected)
    }
}
