use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

pub const UNAVAILABLE_MESSAGE: &str = "ML processing is not available in this deployment. \
Please run the application with the inference environment installed for full functionality.";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Failed to download image: HTTP status {status}")]
    DownloadFailed { status: u16 },
    #[error("Image exceeds the {limit} byte download limit")]
    ImageTooLarge { limit: u64 },
    #[error("Missing dependency: {} not found", path.display())]
    MissingDependency { path: PathBuf },
    #[error("Failed to start inference program: {0}")]
    LaunchFailed(String),
    #[error("Inference program timed out after {secs}s. stdout: {stdout} stderr: {stderr}")]
    Timeout {
        secs: u64,
        stdout: String,
        stderr: String,
    },
    #[error("Inference program failed with exit code {code}: {stderr}")]
    ExternalProcessFailed { code: i32, stderr: String },
    #[error("Inference program exited successfully but wrote no output image at {}", path.display())]
    MissingOutputArtifact { path: PathBuf },
    #[error("{}", UNAVAILABLE_MESSAGE)]
    Unavailable,
    #[error("Unexpected failure: {0}")]
    UnexpectedFailure(String),
}

impl PipelineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PipelineError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short name used as a metrics attribute.
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::InvalidRequest(_) => "invalid_request",
            PipelineError::DownloadFailed { .. } => "download_failed",
            PipelineError::ImageTooLarge { .. } => "image_too_large",
            PipelineError::MissingDependency { .. } => "missing_dependency",
            PipelineError::LaunchFailed(_) => "launch_failed",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::ExternalProcessFailed { .. } => "external_process_failed",
            PipelineError::MissingOutputArtifact { .. } => "missing_output_artifact",
            PipelineError::Unavailable => "unavailable",
            PipelineError::UnexpectedFailure(_) => "unexpected_failure",
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::UnexpectedFailure(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::UnexpectedFailure(format!("image download error: {}", err))
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            PipelineError::InvalidRequest("imageUrl is required".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PipelineError::Unavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            PipelineError::DownloadFailed { status: 404 }.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            PipelineError::Timeout {
                secs: 120,
                stdout: String::new(),
                stderr: String::new()
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_messages_carry_diagnostics() {
        let err = PipelineError::ExternalProcessFailed {
            code: 3,
            stderr: "{\"error\": \"bad weights\"}".into(),
        };
        let message = err.to_string();
        assert!(message.contains("exit code 3"));
        assert!(message.contains("bad weights"));

        let err = PipelineError::MissingDependency {
            path: PathBuf::from("ml/best.pt"),
        };
        assert!(err.to_string().contains("ml/best.pt"));

        let err = PipelineError::DownloadFailed { status: 403 };
        assert!(err.to_string().contains("403"));

        let err = PipelineError::ImageTooLarge { limit: 1024 };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("1024 byte"));
    }
}
