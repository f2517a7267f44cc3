use axum::http::StatusCode;

/// Shared error type used across all Model Bazaar crates.
///
/// Each variant maps to exactly one HTTP status and a stable message
/// prefix, so callers (and tests) can match on the rendered string.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid_argument: {0}")]
    InvalidArgument(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not_found: {0}")]
    NotFound(String),

    #[error("already_exists: {0}")]
    AlreadyExists(String),

    #[error("precondition_failed: {0}")]
    PreconditionFailed(String),

    #[error("license_exhausted: {0}")]
    LicenseExhausted(String),

    #[error("scheduler_unavailable: {0}")]
    SchedulerUnavailable(String),

    #[error("low_disk: {0}")]
    LowDisk(String),

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The HTTP status this error renders as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Error::LicenseExhausted(_) => StatusCode::PAYMENT_REQUIRED,
            Error::SchedulerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::LowDisk(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether retrying the same request could succeed. Application errors
    /// (validation, permission) are never retried; transport-level failures
    /// against the scheduler are.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::SchedulerUnavailable(_) | Error::LowDisk(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(format!("io: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("json: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_prefix_is_stable() {
        let e = Error::AlreadyExists("model docs".into());
        assert!(e.to_string().starts_with("already_exists: "));
        assert_eq!(e.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn only_transport_errors_are_transient() {
        assert!(Error::SchedulerUnavailable("timeout".into()).is_transient());
        assert!(!Error::Forbidden("no".into()).is_transient());
        assert!(!Error::InvalidArgument("bad name".into()).is_transient());
    }
}
