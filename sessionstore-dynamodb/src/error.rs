//! Error types for session operations.

use crate::table::Item;
use std::time::Duration;
use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors reported by a [`SessionTable`](crate::table::SessionTable) backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// A conditional write did not match the stored item.
    ///
    /// `current` holds the item as it stood when the check failed, when the
    /// request asked for it. `None` there means the item does not exist.
    #[error("Conditional check failed")]
    ConditionalCheckFailed { current: Option<Item> },

    /// The table (or index) does not exist.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// The request never reached the service (connection, dispatch, timeout).
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The service rejected the request because of throughput limits.
    #[error("Request throttled: {0}")]
    Throttled(String),

    /// Any other service-side error.
    #[error("Service error ({code}): {message}")]
    Service { code: String, message: String },
}

impl BackendError {
    /// Create a generic service error.
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether this is a failed conditional write.
    pub fn is_conditional_check_failed(&self) -> bool {
        matches!(self, Self::ConditionalCheckFailed { .. })
    }
}

/// How an error may be treated by an [`ErrorHandler`](crate::handler::ErrorHandler).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Always propagated to the caller.
    Hard,
    /// May be recorded to the operator error channel and swallowed.
    Soft,
}

/// Session-specific errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No secret key configured, so identifiers can be neither issued nor verified
    #[error("No secret key provided")]
    MissingSecret,

    /// The client presented an identifier whose integrity tag does not match
    #[error("Corrupt session id")]
    InvalidIdentifier,

    /// A record with this id already exists
    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    /// Waited longer than `lock_max_wait_time` for a session lock
    #[error("Maximum time spent acquiring lock exceeded ({waited:?})")]
    LockWaitTimeout { waited: Duration },

    /// Backend error
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// A batch delete still reported unprocessed items after every retry
    #[error("Garbage collection gave up with {remaining} unprocessed deletes")]
    GcRetriesExhausted { remaining: usize },
}

impl SessionError {
    /// Classify the error for the error policy.
    ///
    /// Hard errors are never swallowed by the default handler.
    pub fn severity(&self) -> Severity {
        match self {
            SessionError::MissingSecret
            | SessionError::LockWaitTimeout { .. }
            | SessionError::AlreadyExists(_)
            | SessionError::Config(_) => Severity::Hard,
            SessionError::Backend(
                BackendError::ConditionalCheckFailed { .. }
                | BackendError::ResourceNotFound(_)
                | BackendError::Unavailable(_),
            ) => Severity::Hard,
            _ => Severity::Soft,
        }
    }

    /// Shorthand for `severity() == Severity::Hard`.
    pub fn is_hard(&self) -> bool {
        self.severity() == Severity::Hard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_errors() {
        assert!(SessionError::MissingSecret.is_hard());
        assert!(
            SessionError::LockWaitTimeout {
                waited: Duration::from_secs(1)
            }
            .is_hard()
        );
        assert!(SessionError::AlreadyExists("abc".into()).is_hard());
        assert!(
            SessionError::Backend(BackendError::ConditionalCheckFailed { current: None })
                .is_hard()
        );
        assert!(SessionError::Backend(BackendError::ResourceNotFound("sessions".into())).is_hard());
        assert!(SessionError::Backend(BackendError::Unavailable("dns".into())).is_hard());
    }

    #[test]
    fn test_soft_errors() {
        assert_eq!(
            SessionError::Backend(BackendError::Throttled("slow down".into())).severity(),
            Severity::Soft
        );
        assert_eq!(
            SessionError::Backend(BackendError::service("InternalServerError", "boom")).severity(),
            Severity::Soft
        );
        assert_eq!(SessionError::InvalidIdentifier.severity(), Severity::Soft);
        assert_eq!(
            SessionError::Deserialization("bad json".into()).severity(),
            Severity::Soft
        );
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(SessionError::MissingSecret.to_string(), "No secret key provided");
        assert_eq!(SessionError::InvalidIdentifier.to_string(), "Corrupt session id");
        let err = SessionError::from(BackendError::service("ValidationException", "bad key"));
        assert_eq!(
            err.to_string(),
            "Backend error: Service error (ValidationException): bad key"
        );
    }
}
