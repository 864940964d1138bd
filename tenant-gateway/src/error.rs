//! Request-level failures of the gateway and their HTTP mapping.
//!
//! JSON bodies come from `service_core::error::AppError`; unknown routes get
//! a plain-text 404 instead.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use service_core::error::AppError;

use crate::models::TenantError;
use crate::services::{AuthError, RewriteError, UpstreamError};

pub const AUTHENTICATION_REQUIRED: &str = "Unauthorized: authentication required";
pub const NOT_FOUND_BODY: &str = "404 - Page not found\n";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("missing required query parameter: {0}")]
    MissingParameter(&'static str),

    #[error("invalid query: {0}")]
    Rewrite(#[from] RewriteError),

    #[error("invalid request path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("404 - Page not found")]
    NotFound,
}

impl GatewayError {
    pub fn authentication_required() -> Self {
        Self::Unauthorized(AUTHENTICATION_REQUIRED.to_string())
    }
}

impl From<TenantError> for GatewayError {
    fn from(err: TenantError) -> Self {
        Self::Unauthorized(err.to_string())
    }
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        // The verification detail stays in the logs.
        tracing::debug!(error = %err, "Identity token rejected");
        Self::Unauthorized("Unauthorized: invalid identity token".to_string())
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unauthorized(_) => AppError::Unauthorized(anyhow::anyhow!(err)),
            GatewayError::MissingParameter(_)
            | GatewayError::Rewrite(_)
            | GatewayError::InvalidPath(_)
            | GatewayError::Upstream(UpstreamError::PathChanged(_)) => {
                AppError::BadRequest(anyhow::anyhow!(err))
            }
            GatewayError::Upstream(e) => AppError::BadGateway(e.to_string()),
            GatewayError::NotFound => AppError::NotFound(anyhow::anyhow!(err)),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::NotFound => (
                StatusCode::NOT_FOUND,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                NOT_FOUND_BODY,
            )
                .into_response(),
            other => AppError::from(other).into_response(),
        }
    }
}
