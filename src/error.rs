//! Typed errors and HTTP mapping.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Seconds a client should wait before retrying after a provisioning failure.
pub const PROVISIONING_RETRY_AFTER_SECS: u64 = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("no usable tenant identity on the authenticated principal")]
    MissingIdentity,
    #[error("invalid tenant header: {0}")]
    InvalidTenantHeader(String),
    #[error("invalid tenant key: {0}")]
    InvalidTenantKey(String),
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("unknown subscription status: {0}")]
    UnknownSubscriptionStatus(String),
    #[error("organization not found: {0}")]
    OrganizationNotFound(String),
    #[error("organization is not active: {0}")]
    OrganizationInactive(Uuid),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid setting {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error("tenant schema: {0}")]
    Schema(String),
}

#[derive(Error, Debug)]
pub enum TenancyError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("provisioning {tenant} failed: {reason}")]
    Provisioning { tenant: String, reason: String },
    #[error("connection to {tenant} failed: {message}")]
    Connection { tenant: String, message: String },
    #[error("more than one engine observed for {tenant}")]
    CacheInvariantViolation { tenant: String },
    #[error("backup: {0}")]
    Backup(String),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl TenancyError {
    pub fn provisioning(tenant: impl ToString, reason: impl ToString) -> Self {
        TenancyError::Provisioning {
            tenant: tenant.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn connection(tenant: impl ToString, message: impl ToString) -> Self {
        TenancyError::Connection {
            tenant: tenant.to_string(),
            message: message.to_string(),
        }
    }

    /// Provisioning and connection failures are never cached; the next access retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TenancyError::Provisioning { .. } | TenancyError::Connection { .. }
        )
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ResolutionError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ResolutionError::OrganizationNotFound(_) => (StatusCode::NOT_FOUND, "organization_not_found"),
            ResolutionError::OrganizationInactive(_) => (StatusCode::FORBIDDEN, "organization_inactive"),
            ResolutionError::MissingIdentity => (StatusCode::BAD_REQUEST, "tenant_required"),
            ResolutionError::InvalidTenantHeader(_)
            | ResolutionError::InvalidTenantKey(_)
            | ResolutionError::UnknownRole(_)
            | ResolutionError::UnknownSubscriptionStatus(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        }
    }
}

impl IntoResponse for ResolutionError {
    fn into_response(self) -> Response {
        TenancyError::Resolution(self).into_response()
    }
}

impl IntoResponse for TenancyError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            TenancyError::Resolution(e) => {
                let (status, code) = e.status_and_code();
                (status, code, self.to_string())
            }
            TenancyError::Provisioning { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "tenant_provisioning",
                "tenant database is being prepared, retry shortly".to_string(),
            ),
            TenancyError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                "service misconfigured".to_string(),
            ),
            // No tenant-specific detail leaves the process for these.
            TenancyError::Connection { .. }
            | TenancyError::CacheInvariantViolation { .. }
            | TenancyError::Db(_)
            | TenancyError::Io(_)
            | TenancyError::Backup(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal server error".to_string(),
            ),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, code, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message,
                details: None,
            },
        };
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(PROVISIONING_RETRY_AFTER_SECS),
            );
        }
        response
    }
}
