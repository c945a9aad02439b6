use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("A file must be provided")]
    MissingFile,

    /// `size` is the declared size, or a lower bound when the body was cut off
    #[error("File exceeds the upload limit of {}", describe_size(.max))]
    FileTooLarge { size: u64, max: u64 },

    #[error("Unsupported file format{}. Supported formats: {}", describe_extension(.extension), .supported.join(", "))]
    UnsupportedFormat {
        extension: Option<String>,
        supported: Vec<&'static str>,
    },

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Could not decode file: {0}")]
    DecodeFailure(String),

    #[error("Render engine unavailable: {0}")]
    RenderEngineUnavailable(String),

    #[error("Rendering timed out after {0} seconds")]
    RenderTimeout(u64),

    #[error("Rendering failed: {0}")]
    RenderFailure(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn describe_extension(extension: &Option<String>) -> String {
    match extension {
        Some(ext) => format!(" '.{}'", ext),
        None => String::new(),
    }
}

const MIB: u64 = 1024 * 1024;

/// Whole megabytes when exact, one decimal above 1 MB, bytes below it
fn describe_size(bytes: &u64) -> String {
    let bytes = *bytes;
    if bytes >= MIB && bytes % MIB == 0 {
        format!("{} MB", bytes / MIB)
    } else if bytes >= MIB {
        format!("{:.1} MB", bytes as f64 / MIB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::MissingFile => StatusCode::BAD_REQUEST,
            AppError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::UnsupportedFormat { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::DecodeFailure(_) => StatusCode::BAD_REQUEST,
            AppError::RenderEngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::RenderTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::RenderFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand back to the caller. Engine and internal details
    /// stay in the server log.
    pub fn public_message(&self) -> String {
        match self {
            AppError::RenderEngineUnavailable(_) => {
                "PDF rendering engine is currently unavailable".to_string()
            }
            AppError::RenderFailure(_) => "PDF rendering failed".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        let body = Json(json!({
            "error": self.public_message(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
