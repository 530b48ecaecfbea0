// ABOUTME: Maps sandbox library errors onto HTTP status codes
// ABOUTME: Every failure leaves the API as a JSON body of the form {"error": "..."}

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dappbox_sandbox::{
    BootstrapError, CommandError, DevServerError, GitError, ProviderError, RegistryError,
    SyncError,
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Provider(String),

    #[error("{0}")]
    Internal(String),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Provider(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed ({}): {}", status, self);
        } else {
            warn!("Request rejected ({}): {}", status, self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Client-side rejections become validation errors; the rest are internal
fn rejection(status: StatusCode, message: String) -> ApiError {
    if status.is_client_error() {
        ApiError::Validation(message)
    } else {
        ApiError::Internal(message)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        rejection(e.status(), e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        rejection(e.status(), e.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(e: PathRejection) -> Self {
        rejection(e.status(), e.body_text())
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        ApiError::Provider(e.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::InvalidProjectId { .. } => ApiError::Validation(e.to_string()),
            RegistryError::Unavailable { .. } => ApiError::Unavailable(e.to_string()),
        }
    }
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Registry(e) => e.into(),
            CommandError::EmptyCommand => ApiError::Validation(e.to_string()),
            CommandError::Provider(e) => e.into(),
            CommandError::Prepare { .. } => ApiError::Provider(e.to_string()),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::InvalidPath { .. } => ApiError::Validation(e.to_string()),
            SyncError::Registry(e) => e.into(),
            SyncError::Command(e) => e.into(),
            SyncError::Provider(e) => e.into(),
            SyncError::Staging(_) => ApiError::Internal(e.to_string()),
            SyncError::NoSandbox(_) => ApiError::NotFound(e.to_string()),
        }
    }
}

impl From<DevServerError> for ApiError {
    fn from(e: DevServerError) -> Self {
        match e {
            DevServerError::Registry(e) => e.into(),
            DevServerError::Command(e) => e.into(),
            DevServerError::Provider(e) => e.into(),
            DevServerError::NoSandbox(_) => ApiError::NotFound(e.to_string()),
        }
    }
}

impl From<GitError> for ApiError {
    fn from(e: GitError) -> Self {
        match e {
            GitError::Command(e) => e.into(),
            GitError::InvalidHash(_) | GitError::EmptyMessage => {
                ApiError::Validation(e.to_string())
            }
            GitError::Failed { .. } => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<BootstrapError> for ApiError {
    fn from(e: BootstrapError) -> Self {
        match e {
            BootstrapError::InvalidAppName(_) => ApiError::Validation(e.to_string()),
            BootstrapError::Command(e) => e.into(),
            BootstrapError::Sync(e) => e.into(),
            BootstrapError::Failed { .. } => ApiError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(CommandError::EmptyCommand).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(RegistryError::Unavailable {
                project_id: "demo".to_string(),
                source: ProviderError::NotAvailable("down".to_string()),
            })
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(SyncError::Provider(ProviderError::FileError("x".to_string())))
                .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(GitError::InvalidHash("zz".to_string())).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_nested_errors_keep_their_class() {
        let nested = SyncError::Command(CommandError::Registry(RegistryError::InvalidProjectId {
            project_id: "../x".to_string(),
            reason: "bad".to_string(),
        }));
        assert_eq!(ApiError::from(nested).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_missing_sandbox_is_not_found() {
        assert_eq!(
            ApiError::from(SyncError::NoSandbox("ghost".to_string())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(DevServerError::NoSandbox("ghost".to_string())).status(),
            StatusCode::NOT_FOUND
        );
    }
}
