//! Error types for the execution gateway.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur anywhere in the gateway pipeline.
///
/// Messages are stable and never mention host paths outside the sandbox
/// root, environment values, or data belonging to other requests.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Unknown, missing, mistyped or privileged parameter.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The operation or function is not part of the callable surface.
    #[error("function not found: {0}")]
    FunctionNotFound(String),

    /// A path tried to leave the sandbox root.
    #[error("path escape: {0}")]
    PathEscape(String),

    /// A discovery path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The module could not be read, parsed or compiled.
    #[error("failed to load module: {0}")]
    Load(String),

    /// The invoked function raised.
    #[error("{exception_type}: {message}")]
    Execution {
        /// The raised exception type (e.g. "ValueError").
        exception_type: String,
        /// The exception message.
        message: String,
        /// Backtrace text captured at the raise site.
        traceback: Option<String>,
    },

    /// The execution exceeded the configured wall-clock timeout.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// A memory, buffer, collection, file-handle or fuel ceiling was breached.
    #[error("resource limit exceeded: {0}")]
    ResourceExceeded(String),

    /// A filesystem, network, process or dynamic-loading attempt was refused.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The caller made too many requests in the active window.
    #[error("rate limit exceeded: at most {limit} requests per {window:?}")]
    RateLimitExceeded {
        /// Configured ceiling.
        limit: u32,
        /// Configured window length.
        window: Duration,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error outside of guest execution.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The audit trail could not be written or verified.
    #[error("audit log error: {0}")]
    Audit(String),
}

/// Stable, serializable classification of a [`GatewayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    FunctionNotFound,
    PathEscape,
    NotFound,
    LoadError,
    ExecutionError,
    TimeoutError,
    ResourceExceeded,
    PermissionDenied,
    RateLimitExceeded,
    ConfigError,
    InternalError,
}

impl ErrorKind {
    /// The stable wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::FunctionNotFound => "FunctionNotFound",
            ErrorKind::PathEscape => "PathEscape",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::LoadError => "LoadError",
            ErrorKind::ExecutionError => "ExecutionError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::ResourceExceeded => "ResourceExceeded",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::RateLimitExceeded => "RateLimitExceeded",
            ErrorKind::ConfigError => "ConfigError",
            ErrorKind::InternalError => "InternalError",
        }
    }

    /// Whether errors of this kind are raised before anything executes.
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            ErrorKind::ValidationError
                | ErrorKind::FunctionNotFound
                | ErrorKind::PathEscape
                | ErrorKind::RateLimitExceeded
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl GatewayError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Validation(_) => ErrorKind::ValidationError,
            GatewayError::FunctionNotFound(_) => ErrorKind::FunctionNotFound,
            GatewayError::PathEscape(_) => ErrorKind::PathEscape,
            GatewayError::NotFound(_) => ErrorKind::NotFound,
            GatewayError::Load(_) => ErrorKind::LoadError,
            GatewayError::Execution { .. } => ErrorKind::ExecutionError,
            GatewayError::Timeout(_) => ErrorKind::TimeoutError,
            GatewayError::ResourceExceeded(_) => ErrorKind::ResourceExceeded,
            GatewayError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            GatewayError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            GatewayError::Config(_) => ErrorKind::ConfigError,
            GatewayError::Io(_) | GatewayError::Audit(_) => ErrorKind::InternalError,
        }
    }

    /// The caller-facing message, without the kind prefix.
    pub fn message(&self) -> String {
        match self {
            GatewayError::Validation(m)
            | GatewayError::FunctionNotFound(m)
            | GatewayError::PathEscape(m)
            | GatewayError::NotFound(m)
            | GatewayError::Load(m)
            | GatewayError::ResourceExceeded(m)
            | GatewayError::PermissionDenied(m)
            | GatewayError::Config(m)
            | GatewayError::Audit(m) => m.clone(),
            GatewayError::Execution { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Check if this error represents a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::Timeout(_))
    }

    /// Check if this error represents a breached resource ceiling.
    pub fn is_resource_exceeded(&self) -> bool {
        matches!(self, GatewayError::ResourceExceeded(_))
    }

    /// Check if this error was raised by the invoked function.
    pub fn is_execution_error(&self) -> bool {
        matches!(self, GatewayError::Execution { .. })
    }

    /// Check if this error is a refused capability.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, GatewayError::PermissionDenied(_))
    }

    /// Check if this error is a rate-limit rejection.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, GatewayError::RateLimitExceeded { .. })
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        let err = GatewayError::Timeout(Duration::from_secs(5));
        assert_eq!(err.kind().as_str(), "TimeoutError");
        assert_eq!(
            serde_json::to_string(&ErrorKind::RateLimitExceeded).unwrap(),
            "\"RateLimitExceeded\""
        );
        assert_eq!(
            GatewayError::Load("bad magic".into()).kind(),
            ErrorKind::LoadError
        );
    }

    #[test]
    fn test_execution_message_is_bare() {
        let err = GatewayError::Execution {
            exception_type: "ValueError".to_string(),
            message: "boom".to_string(),
            traceback: None,
        };
        assert_eq!(err.message(), "boom");
        assert_eq!(err.to_string(), "ValueError: boom");
        assert!(err.is_execution_error());
    }

    #[test]
    fn test_pre_execution_kinds() {
        assert!(ErrorKind::ValidationError.is_pre_execution());
        assert!(ErrorKind::RateLimitExceeded.is_pre_execution());
        assert!(!ErrorKind::TimeoutError.is_pre_execution());
        assert!(!ErrorKind::ExecutionError.is_pre_execution());
    }

    #[test]
    fn test_error_helpers() {
        let timeout = GatewayError::Timeout(Duration::from_secs(5));
        assert!(timeout.is_timeout());
        assert!(!timeout.is_resource_exceeded());

        let memory = GatewayError::ResourceExceeded("memory".to_string());
        assert!(memory.is_resource_exceeded());
        assert!(!memory.is_timeout());

        let limited = GatewayError::RateLimitExceeded {
            limit: 3,
            window: Duration::from_secs(60),
        };
        assert!(limited.is_rate_limited());
        assert!(limited.message().contains("at most 3"));

        let io = GatewayError::from(std::io::Error::other("disk"));
        assert_eq!(io.kind(), ErrorKind::InternalError);
    }
}
