//! HTTP front end: `POST /analyze` with a multipart image upload.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, State, multipart::MultipartError},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::artifact::{ArtifactError, ArtifactStore};
use crate::engine::{AnalyzeRequest, Engine};
use crate::error::VqaError;
use crate::generation::{DEFAULT_MAX_NEW_TOKENS, DEFAULT_NUM_BEAMS, GenerationConfig};
use crate::image_io::decode_image_rgb8;
use crate::model::VisionLanguageModel;

/// Largest accepted request body.
pub const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Shared state of the HTTP handlers.
pub struct AppState<M: VisionLanguageModel + Send + 'static> {
    pub engine: Arc<Engine<M>>,
    pub store: Arc<ArtifactStore>,
}

impl<M: VisionLanguageModel + Send + 'static> Clone for AppState<M> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            store: self.store.clone(),
        }
    }
}

/// Body of a successful `POST /analyze`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AnalyzeReply {
    pub prediction: String,
}

/// Errors returned at the HTTP boundary as `{"error": {"message", "type"}}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Vqa(#[from] VqaError),

    #[error("{0}")]
    Internal(String),
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::BadRequest(format!("malformed multipart body: {}", err.body_text()))
    }
}

impl ApiError {
    /// The status code and the machine readable error type.
    pub fn kind(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) | ApiError::Vqa(VqaError::InvalidConfig(_)) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error")
            }
            ApiError::Vqa(VqaError::InputDecode(_) | VqaError::Image(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "input_decode_error")
            }
            ApiError::Vqa(VqaError::Artifact(ArtifactError::Conflict(_))) => {
                (StatusCode::CONFLICT, "artifact_write_conflict")
            }
            ApiError::Vqa(VqaError::Artifact(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "artifact_write_error")
            }
            ApiError::Vqa(VqaError::EngineStopped) => {
                (StatusCode::SERVICE_UNAVAILABLE, "engine_unavailable")
            }
            ApiError::Vqa(VqaError::Model(_) | VqaError::Panicked(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "generation_error")
            }
            ApiError::Vqa(_) | ApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.kind();
        if status.is_server_error() {
            log::error!("Request failed: {self}");
        } else {
            log::debug!("Rejected request: {self}");
        }
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Fields of the `POST /analyze` multipart form.
#[derive(Debug)]
struct AnalyzeForm {
    file: Vec<u8>,
    query: String,
    max_new_tokens: usize,
    num_beams: usize,
    save_response: bool,
}

impl AnalyzeForm {
    async fn from_multipart(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut file = None;
        let mut query = None;
        let mut max_new_tokens = DEFAULT_MAX_NEW_TOKENS;
        let mut num_beams = DEFAULT_NUM_BEAMS;
        let mut save_response = false;

        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => file = Some(field.bytes().await?.to_vec()),
                "query" => query = Some(field.text().await?),
                "max_new_tokens" => max_new_tokens = parse_count(&name, &field.text().await?)?,
                "num_beams" => num_beams = parse_count(&name, &field.text().await?)?,
                "save_response" => save_response = parse_form_bool(&field.text().await?)?,
                _ => log::debug!("Ignoring form field {name}"),
            }
        }

        let Some(file) = file else {
            return Err(ApiError::BadRequest("missing form field: file".into()));
        };
        let Some(query) = query else {
            return Err(ApiError::BadRequest("missing form field: query".into()));
        };

        Ok(Self {
            file,
            query,
            max_new_tokens,
            num_beams,
            save_response,
        })
    }
}

fn parse_count(name: &str, value: &str) -> Result<usize, ApiError> {
    match value.trim().parse::<usize>() {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(ApiError::BadRequest(format!(
            "{name} must be a positive integer, got {value:?}"
        ))),
    }
}

/// Parses the boolean spellings accepted by HTML forms.
pub fn parse_form_bool(value: &str) -> Result<bool, ApiError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ApiError::BadRequest(format!(
            "save_response must be a boolean, got {other:?}"
        ))),
    }
}

async fn post_analyze<M: VisionLanguageModel + Send + 'static>(
    State(state): State<AppState<M>>,
    multipart: Multipart,
) -> Result<Json<AnalyzeReply>, ApiError> {
    let form = AnalyzeForm::from_multipart(multipart).await?;
    log::debug!(
        "Analyze request: {} bytes, max_new_tokens={}, num_beams={}, save_response={}",
        form.file.len(),
        form.max_new_tokens,
        form.num_beams,
        form.save_response
    );

    let AppState { engine, store } = state;
    let prediction = tokio::task::spawn_blocking(move || -> Result<String, VqaError> {
        let image = decode_image_rgb8(&form.file)?;
        let response = engine.analyze(AnalyzeRequest {
            image,
            query: form.query,
            config: GenerationConfig::new(form.max_new_tokens, form.num_beams),
        })?;

        if form.save_response {
            store.persist(&response.image, &response.prediction)?;
        }
        Ok(response.prediction)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("analysis task failed: {e}")))??;

    Ok(Json(AnalyzeReply { prediction }))
}

async fn get_status<M: VisionLanguageModel + Send + 'static>(
    State(state): State<AppState<M>>,
) -> impl IntoResponse {
    Json(json!({ "status": state.engine.state().as_str() }))
}

/// Builds the service router.
pub fn router<M: VisionLanguageModel + Send + 'static>(state: AppState<M>) -> Router {
    Router::new()
        .route("/", get(|| async { "Welcome to Infernum VQA!" }))
        .route("/status", get(get_status::<M>))
        .route("/analyze", post(post_analyze::<M>))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}
