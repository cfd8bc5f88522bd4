//! Error taxonomy for the lifecycle manager. Callers branch on the variant:
//! registry trouble is retryable, a missing artifact is fatal to readiness,
//! bad input is the client's problem.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LifecycleError {
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),
    #[error("no production version registered for model '{0}'")]
    NoProductionVersion(String),
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),
    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),
    #[error("invalid input: {field} {reason}")]
    InvalidInput { field: &'static str, reason: String },
    #[error("model not loaded")]
    ModelNotReady,
    #[error("prediction failed: {0}")]
    PredictorFailure(String),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

impl LifecycleError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidInput { field, reason: reason.into() }
    }

    /// Only registry reachability problems are worth trying again later.
    pub fn is_retryable(&self) -> bool { matches!(self, Self::RegistryUnavailable(_)) }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegistryUnavailable(_) => "registry_unavailable",
            Self::NoProductionVersion(_) => "no_production_version",
            Self::ArtifactNotFound(_) => "artifact_not_found",
            Self::InvalidArtifact(_) => "invalid_artifact",
            Self::InvalidInput { .. } => "invalid_input",
            Self::ModelNotReady => "model_not_ready",
            Self::PredictorFailure(_) => "predictor_failure",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RegistryUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::NoProductionVersion(_) => StatusCode::NOT_FOUND,
            Self::InvalidInput { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ModelNotReady => StatusCode::SERVICE_UNAVAILABLE,
            Self::ArtifactNotFound(_) | Self::InvalidArtifact(_) | Self::PredictorFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for LifecycleError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.kind(), "detail": self.to_string() });
        (self.status_code(), Json(body)).into_response()
    }
}
