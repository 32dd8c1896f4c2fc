//! Custom error types exposed across the application.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// The primary error type for the application.
#[derive(Debug, Error)]
pub enum AppError {
    /// No credentials were supplied on a protected endpoint.
    #[error("Authorization header required")]
    AuthMissing,

    /// Credentials were supplied but did not match any known API key.
    #[error("Invalid API key")]
    AuthInvalid,

    /// The user already has a request in flight and the bounded wait elapsed.
    #[error("Previous request still processing, please try again later")]
    UserBusy,

    /// Placement found no worker that could serve the request.
    #[error("{0}")]
    CapacityUnavailable(String),

    /// The cloud control plane failed to resume a workspace in time.
    #[error("Failed to start GPU: {0}")]
    ResumeFailed(String),

    /// The inference worker rejected or failed the model preload.
    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    /// The worker returned an error or dropped the connection mid-request.
    #[error("Upstream worker error: {0}")]
    UpstreamFailed(String),

    /// An unknown worker id was referenced.
    #[error("Unknown GPU: {0}")]
    NotFound(String),

    /// An operation was requested in a state that cannot accept it.
    #[error("{0}")]
    BadState(String),

    /// Error from the cloud control-plane client.
    #[error("Cloud API error: {0}")]
    Cloud(#[from] crate::cloud::CloudError),

    /// Error related to configuration loading or parsing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Anything else that should not leak details to the client.
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::AuthMissing | AppError::AuthInvalid => StatusCode::UNAUTHORIZED,
            AppError::UserBusy => StatusCode::TOO_MANY_REQUESTS,
            AppError::CapacityUnavailable(_)
            | AppError::ResumeFailed(_)
            | AppError::ModelLoadFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadState(_) => StatusCode::BAD_REQUEST,
            AppError::UpstreamFailed(_)
            | AppError::Cloud(_)
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({ "detail": self.to_string() }));

        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_map_to_401_with_challenge() {
        let response = AppError::AuthMissing.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok()),
            Some("Bearer")
        );
    }

    #[test]
    fn taxonomy_maps_to_expected_statuses() {
        assert_eq!(
            AppError::UserBusy.into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::CapacityUnavailable("no GPUs".into())
                .into_response()
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::NotFound("gpu9".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::BadState("cannot pause".into())
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::UpstreamFailed("boom".into())
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
