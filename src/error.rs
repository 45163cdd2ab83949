// Error kinds for model loading, inference and the HTTP boundary
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Failures while loading the model artifact at startup.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("{file} not found in {dir}")]
    MissingFile { file: String, dir: PathBuf },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid model config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to load tokenizer: {0}")]
    Tokenizer(String),

    #[error("failed to load weights: {0}")]
    Weights(#[from] candle::Error),

    #[error("unsupported device '{0}'")]
    Device(String),

    #[error("label configuration error: {0}")]
    Labels(String),
}

/// Failures while classifying a single text.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("empty text provided")]
    EmptyInput,

    #[error("tokenization failed: {0}")]
    Tokenization(String),

    #[error("forward pass failed: {0}")]
    Forward(#[from] candle::Error),

    #[error("model produced an invalid distribution: {0}")]
    InvalidOutput(String),
}

/// Errors returned to HTTP callers. This is the only place internal
/// failures become status codes.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Model not loaded")]
    ModelNotLoaded,

    #[error("{0}")]
    BadRequest(String),

    #[error("Request body too large")]
    PayloadTooLarge,

    /// Details stay in the server log.
    #[error("Prediction failed")]
    Inference,

    #[error("Endpoint not found")]
    NotFound,

    #[error("Method not allowed")]
    MethodNotAllowed,
}

impl ServiceError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::ModelNotLoaded => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Inference => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.to_string(),
        })
    }
}
