//! The service error type: a status code plus human-readable context.

use std::io;

use thiserror::Error;

use crate::status::StatusCode;

/// Result type used across the service crates.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// An operation failure carrying its taxonomy code and a message for the log.
#[derive(Debug, Clone, Error)]
#[error("{status}: {message}")]
pub struct ServiceError {
    /// Taxonomy code determining the HTTP projection.
    pub status: StatusCode,
    /// Human-readable context, written for the daemon log.
    pub message: String,
}

impl ServiceError {
    /// Builds an error from a status code and message.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Precondition violated by this process.
    pub fn logic(message: impl Into<String>) -> Self {
        Self::new(StatusCode::LogicError, message)
    }

    /// Uncategorized internal failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InternalError, message)
    }

    /// Validator rejection or incomplete upload.
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidValue, message)
    }

    /// Filesystem failure with the triggering context.
    pub fn file_not_accessible(context: &str, source: &io::Error) -> Self {
        Self::new(StatusCode::FileNotAccessible, format!("{context}: {source}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let error = ServiceError::logic("tried to write a readonly file");
        assert_eq!(
            error.to_string(),
            "logic_error: tried to write a readonly file"
        );
    }

    #[test]
    fn io_context_is_preserved() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "no such file");
        let error = ServiceError::file_not_accessible("failed to open \"/tmp/x\"", &io_error);
        assert_eq!(error.status, StatusCode::FileNotAccessible);
        assert!(error.message.contains("/tmp/x"));
        assert!(error.message.contains("no such file"));
    }
}
