use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::{auth::repo::StoreError, mail::MailError};

/// Stable, machine-readable error category returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Auth,
    InvalidToken,
    InvalidOtp,
    Delivery,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    InvalidToken(String),
    #[error("Invalid or expired OTP")]
    InvalidOtp,
    #[error("{0}")]
    Delivery(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Auth(_) => ErrorKind::Auth,
            Self::InvalidToken(_) => ErrorKind::InvalidToken,
            Self::InvalidOtp => ErrorKind::InvalidOtp,
            Self::Delivery(_) => ErrorKind::Delivery,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation | ErrorKind::Conflict | ErrorKind::InvalidOtp => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Auth | ErrorKind::InvalidToken => StatusCode::UNAUTHORIZED,
            ErrorKind::Delivery | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the caller. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateEmail => Self::Conflict("Email already exists".into()),
            StoreError::Database(e) => Self::Internal(anyhow::Error::new(e).context("user store")),
        }
    }
}

impl From<MailError> for AppError {
    fn from(e: MailError) -> Self {
        error!(error = %e, "email delivery failed");
        Self::Delivery("Error sending email. Please try again.".into())
    }
}

impl From<JsonRejection> for AppError {
    fn from(e: JsonRejection) -> Self {
        tracing::debug!(error = %e, status = %e.status(), "rejected request body");
        Self::validation("Invalid request body")
    }
}

impl From<QueryRejection> for AppError {
    fn from(e: QueryRejection) -> Self {
        tracing::debug!(error = %e, "rejected query string");
        Self::validation("Invalid query parameters")
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    kind: ErrorKind,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Self::Internal(e) = &self {
            error!(error = ?e, "internal error");
        }
        let status = self.status();
        let body = ErrorBody {
            success: false,
            kind: self.kind(),
            message: self.public_message(),
        };
        (status, Json(body)).into_response()
    }
}
