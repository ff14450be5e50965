use crate::{mailer::MailError, media::MediaError, models::ApiError, store::StoreError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use once_cell::sync::OnceCell;
use serde_json::json;
use thiserror::Error;
use tracing::error;

static EXPOSE_DETAIL: OnceCell<bool> = OnceCell::new();

/// Called once at startup. Until then error bodies include diagnostic detail, which is what
/// unit tests see.
pub fn expose_error_detail(expose: bool) {
    let _ = EXPOSE_DETAIL.set(expose);
}

fn detail_exposed() -> bool {
    *EXPOSE_DETAIL.get().unwrap_or(&true)
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("please complete your profile first")]
    IncompleteProfile { email: String },
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{message}: {detail}")]
    Upstream {
        message: &'static str,
        detail: String,
    },
    #[error("{message}: {detail}")]
    Internal {
        message: &'static str,
        detail: String,
    },
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn internal(message: &'static str, detail: impl ToString) -> Self {
        Self::Internal {
            message,
            detail: detail.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::Conflict(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) | AppError::IncompleteProfile { .. } => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Upstream { .. } | AppError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(message) => AppError::Conflict(message),
            other => AppError::internal("Something went wrong", other),
        }
    }
}

impl From<MediaError> for AppError {
    fn from(value: MediaError) -> Self {
        AppError::Upstream {
            message: "Image upload failed",
            detail: value.to_string(),
        }
    }
}

impl From<MailError> for AppError {
    fn from(value: MailError) -> Self {
        AppError::Upstream {
            message: "Failed to send reset code. Please try again later.",
            detail: value.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            AppError::IncompleteProfile { email } => (
                status,
                Json(json!({
                    "message": "Please complete your profile first",
                    "needsProfileCompletion": true,
                    "email": email,
                })),
            )
                .into_response(),
            AppError::Upstream { message, detail } | AppError::Internal { message, detail } => {
                error!(target = "unimart.api", status = status.as_u16(), %detail, "{message}");
                let payload = ApiError {
                    message: message.to_string(),
                    error: detail_exposed().then_some(detail),
                };
                (status, Json(payload)).into_response()
            }
            AppError::Validation(message)
            | AppError::Unauthorized(message)
            | AppError::Forbidden(message)
            | AppError::Conflict(message)
            | AppError::NotFound(message) => {
                let payload = ApiError {
                    message,
                    error: None,
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}
