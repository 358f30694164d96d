use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("model {identity} failed to initialize")]
    Startup {
        identity: String,
        #[source]
        source: Box<ServiceError>,
    },
    #[error("artifact fetch failed: {0}")]
    Fetch(String),
    #[error("artifact not found: {0}")]
    ArtifactMissing(String),
    #[error("model backend error: {0}")]
    Backend(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("prompt is {prompt_tokens} tokens but the model context holds {limit}")]
    ContextOverflow { prompt_tokens: usize, limit: usize },
    #[error("accelerator out of memory: {0}")]
    OutOfMemory(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl ServiceError {
    pub(crate) fn startup(identity: impl ToString, source: ServiceError) -> Self {
        ServiceError::Startup {
            identity: identity.to_string(),
            source: Box::new(source),
        }
    }

    /// Runtime failures are classified as out-of-memory when the backend
    /// message says so; everything else stays a generic inference failure.
    pub(crate) fn from_runtime(message: String) -> Self {
        if message.to_lowercase().contains("out of memory") {
            ServiceError::OutOfMemory(message)
        } else {
            ServiceError::Inference(message)
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::OutOfMemory(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Startup { .. }
            | ServiceError::Fetch(_)
            | ServiceError::ArtifactMissing(_)
            | ServiceError::Backend(_)
            | ServiceError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Tokenizer(_)
            | ServiceError::Inference(_)
            | ServiceError::ContextOverflow { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
