//! Error types for the circulation server

use axum::{
    http::{header::RETRY_AFTER, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Numeric error codes exposed in response bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Failure = 1,
    NotAuthorized = 2,
    DbFailure = 3,
    NoSuchBook = 4,
    NoSuchMember = 5,
    NoSuchLoan = 6,
    NoCopiesAvailable = 7,
    DuplicateLoan = 8,
    AlreadyReturned = 9,
    InvariantViolation = 10,
    Busy = 11,
    Duplicate = 12,
    BadValue = 13,
}

/// Entities the circulation engine looks up by id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Book,
    Member,
    Loan,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Book => write!(f, "Book"),
            Entity::Member => write!(f, "Member"),
            Entity::Loan => write!(f, "Loan"),
        }
    }
}

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("{0} {1} not found")]
    NotFound(Entity, String),

    #[error("No copies available for this book")]
    Exhausted,

    #[error("This book is already issued to this member")]
    DuplicateLoan,

    #[error("Book has already been returned")]
    AlreadyReturned,

    /// Book counters and loan ledger have diverged
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Resource busy: {0}")]
    Busy(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn not_found(entity: Entity, id: impl fmt::Display) -> Self {
        AppError::NotFound(entity, id.to_string())
    }

    /// Whether the caller may safely retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Busy(_))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

/// Error response body
#[derive(Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub code: u32,
    pub error: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Authentication(msg) => {
                (StatusCode::UNAUTHORIZED, ErrorCode::NotAuthorized, msg.clone())
            }
            AppError::Authorization(msg) => {
                (StatusCode::FORBIDDEN, ErrorCode::NotAuthorized, msg.clone())
            }
            AppError::NotFound(entity, _) => {
                let code = match entity {
                    Entity::Book => ErrorCode::NoSuchBook,
                    Entity::Member => ErrorCode::NoSuchMember,
                    Entity::Loan => ErrorCode::NoSuchLoan,
                };
                (StatusCode::NOT_FOUND, code, self.to_string())
            }
            AppError::Exhausted => {
                (StatusCode::CONFLICT, ErrorCode::NoCopiesAvailable, self.to_string())
            }
            AppError::DuplicateLoan => {
                (StatusCode::CONFLICT, ErrorCode::DuplicateLoan, self.to_string())
            }
            AppError::AlreadyReturned => {
                (StatusCode::CONFLICT, ErrorCode::AlreadyReturned, self.to_string())
            }
            AppError::InvariantViolation(msg) => {
                tracing::error!(alert = true, "Circulation invariant violated: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::InvariantViolation,
                    "Inventory is inconsistent with the loan ledger".to_string(),
                )
            }
            AppError::Busy(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, ErrorCode::Busy, msg.clone())
            }
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, ErrorCode::BadValue, msg.clone())
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::DbFailure,
                    "Database error".to_string(),
                )
            }
            AppError::Conflict(msg) => {
                (StatusCode::CONFLICT, ErrorCode::Duplicate, msg.clone())
            }
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, ErrorCode::BadValue, msg.clone())
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::Failure,
                    "Internal server error".to_string(),
                )
            }
        };

        let retryable = self.is_retryable();

        let body = Json(ErrorResponse {
            code: code as u32,
            error: format!("{:?}", code),
            message,
        });

        if retryable {
            (status, [(RETRY_AFTER, "1")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (AppError::not_found(Entity::Book, "x"), StatusCode::NOT_FOUND),
            (AppError::Exhausted, StatusCode::CONFLICT),
            (AppError::DuplicateLoan, StatusCode::CONFLICT),
            (AppError::AlreadyReturned, StatusCode::CONFLICT),
            (AppError::InvariantViolation("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (AppError::Busy("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (AppError::Validation("x".into()), StatusCode::BAD_REQUEST),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn test_busy_is_retryable() {
        let response = AppError::Busy("book locked".into()).into_response();
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "1");
        assert!(!AppError::Exhausted.is_retryable());
    }

    #[test]
    fn test_not_found_message_names_entity() {
        let error = AppError::not_found(Entity::Member, "42");
        assert_eq!(error.to_string(), "Member 42 not found");
    }
}
