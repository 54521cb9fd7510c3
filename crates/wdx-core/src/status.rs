//! Operation status codes and their HTTP projection.
//!
//! Every fallible operation in the service core reports one of these codes.
//! The REST and file frontends translate them to HTTP statuses with
//! [`StatusCode::http_status`]; the descriptions mirror the wire-visible
//! error taxonomy.

use std::fmt;

/// Outcome category of a service operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum StatusCode {
    /// Operation completed.
    Success,
    /// Precondition violated by this process; always a bug.
    LogicError,
    /// Declared capacity above the limit, or a write/read beyond it.
    FileSizeExceeded,
    /// Finish/remove target differs from the active write file-ID.
    FileIdMismatch,
    /// Underlying filesystem error.
    FileNotAccessible,
    /// Validator rejected the content, or the upload was incomplete at finish.
    InvalidValue,
    /// No credentials presented.
    AuthRequired,
    /// Credentials presented but rejected.
    AuthFailed,
    /// Credentials expired; the client should refresh.
    AuthExpired,
    /// Authenticated but not authorized for the feature.
    PermissionDenied,
    /// Uncategorized internal failure.
    InternalError,
}

impl StatusCode {
    /// HTTP status the frontends answer with for this code.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::Success => 200,
            Self::FileSizeExceeded => 413,
            Self::FileIdMismatch => 409,
            Self::InvalidValue => 422,
            Self::AuthRequired | Self::AuthFailed | Self::AuthExpired => 401,
            Self::PermissionDenied => 403,
            Self::LogicError | Self::FileNotAccessible | Self::InternalError => 500,
        }
    }

    /// Stable lower-case name used in log output and error documents.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::LogicError => "logic_error",
            Self::FileSizeExceeded => "file_size_exceeded",
            Self::FileIdMismatch => "file_id_mismatch",
            Self::FileNotAccessible => "file_not_accessible",
            Self::InvalidValue => "invalid_value",
            Self::AuthRequired => "auth_required",
            Self::AuthFailed => "auth_failed",
            Self::AuthExpired => "auth_expired",
            Self::PermissionDenied => "permission_denied",
            Self::InternalError => "internal_error",
        }
    }

    /// True for every code except [`StatusCode::Success`].
    #[must_use]
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::Success)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical reason phrase for the HTTP statuses the service emits.
#[must_use]
pub fn http_status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_mapping_matches_taxonomy() {
        assert_eq!(StatusCode::Success.http_status(), 200);
        assert_eq!(StatusCode::FileSizeExceeded.http_status(), 413);
        assert_eq!(StatusCode::FileIdMismatch.http_status(), 409);
        assert_eq!(StatusCode::InvalidValue.http_status(), 422);
        assert_eq!(StatusCode::AuthRequired.http_status(), 401);
        assert_eq!(StatusCode::AuthExpired.http_status(), 401);
        assert_eq!(StatusCode::PermissionDenied.http_status(), 403);
        assert_eq!(StatusCode::LogicError.http_status(), 500);
        assert_eq!(StatusCode::InternalError.http_status(), 500);
    }

    #[test]
    fn success_is_not_an_error() {
        assert!(!StatusCode::Success.is_error());
        assert!(StatusCode::AuthFailed.is_error());
    }

    #[test]
    fn reason_phrases_cover_emitted_statuses() {
        for code in [200, 400, 401, 403, 404, 409, 413, 422, 500] {
            assert_ne!(http_status_text(code), "Unknown", "missing phrase for {code}");
        }
    }
}
