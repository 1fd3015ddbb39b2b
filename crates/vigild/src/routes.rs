use crate::engine::{EngineError, EngineHandle};
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::block_in_place;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use vigil_core::uploads::UploadError;
use vigil_core::{MatchSettings, PipelineError, StoredUpload, UploadDir};

/// Shared state for all handlers.
pub struct AppState {
    pub engine: EngineHandle,
    pub uploads: UploadDir,
    pub gallery_size: usize,
    pub settings: MatchSettings,
    pub models: ModelInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub face_detector: PathBuf,
    pub face_recognizer: PathBuf,
    pub object_detector: PathBuf,
}

/// Body of both detection endpoints.
#[derive(Debug, Serialize)]
pub struct DetectResponse {
    pub result_img_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub gallery_size: usize,
    pub workers: usize,
    pub threshold: f32,
    pub policy: String,
    pub models: ModelInfo,
}

/// Handler failures, rendered as a `DetectResponse` with a matching status.
#[derive(Debug)]
pub enum ApiError {
    MissingFile,
    Multipart(MultipartError),
    Upload(UploadError),
    Engine(EngineError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingFile => StatusCode::BAD_REQUEST,
            ApiError::Multipart(err) => err.status(),
            ApiError::Upload(UploadError::EmptyName) => StatusCode::BAD_REQUEST,
            ApiError::Upload(UploadError::UnsupportedExtension(_)) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            ApiError::Upload(UploadError::Io { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Engine(EngineError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Engine(EngineError::Pipeline(PipelineError::Decode { .. })) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::MissingFile => "multipart field \"file\" is required".to_string(),
            ApiError::Multipart(err) => err.body_text(),
            ApiError::Upload(err) => err.to_string(),
            ApiError::Engine(err) => err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.message(), "request failed");
        } else {
            tracing::warn!(status = status.as_u16(), error = %self.message(), "request rejected");
        }
        let body = DetectResponse {
            result_img_path: None,
            error: Some(self.message()),
        };
        (status, Json(body)).into_response()
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::Multipart(err)
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        ApiError::Upload(err)
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the HTTP router.
pub fn create_app(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/face-detect", post(face_detect_handler))
        .route("/xray-detect", post(xray_detect_handler))
        .route("/status", get(status_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Detect and identify faces in an uploaded image.
async fn face_detect_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> ApiResult<Json<DetectResponse>> {
    let upload = receive_upload(&state.uploads, multipart).await?;
    let report = state
        .engine
        .face(upload.path.clone(), upload.annotated_path())
        .await
        .inspect_err(|err| log_kept_upload(&upload, err))?;
    tracing::info!(
        upload = %upload.unique_name(),
        faces = report.verdicts.len(),
        matches = report.matches().count(),
        "face-detect done"
    );
    Ok(Json(success(report.output.path)))
}

/// Detect objects in an uploaded X-ray scan.
async fn xray_detect_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> ApiResult<Json<DetectResponse>> {
    let upload = receive_upload(&state.uploads, multipart).await?;
    let report = state
        .engine
        .xray(upload.path.clone(), upload.annotated_path())
        .await
        .inspect_err(|err| log_kept_upload(&upload, err))?;
    tracing::info!(
        upload = %upload.unique_name(),
        objects = report.regions.len(),
        "xray-detect done"
    );
    Ok(Json(success(report.output.path)))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        gallery_size: state.gallery_size,
        workers: state.engine.worker_count(),
        threshold: state.settings.threshold,
        policy: state.settings.policy.to_string(),
        models: state.models.clone(),
    })
}

/// Failed requests leave the stored input in the upload directory.
fn log_kept_upload(upload: &StoredUpload, err: &EngineError) {
    tracing::debug!(
        path = %upload.path.display(),
        error = %err,
        "upload kept after failed request"
    );
}

fn success(path: PathBuf) -> DetectResponse {
    DetectResponse {
        result_img_path: Some(path.to_string_lossy().into_owned()),
        error: None,
    }
}

/// Store the `file` field of the form under a fresh token-prefixed name.
async fn receive_upload(uploads: &UploadDir, mut multipart: Multipart) -> ApiResult<StoredUpload> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await?;
        if bytes.is_empty() {
            return Err(ApiError::MissingFile);
        }
        return Ok(block_in_place(|| uploads.store(&name, &bytes))?);
    }
    Err(ApiError::MissingFile)
}
