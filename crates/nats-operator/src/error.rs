//! Error types for the NATS Kubernetes Operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// API error reported by a non-Kubernetes store backend
    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The governing cancellation token fired while the operation was pending
    #[error("Operation cancelled")]
    Cancelled,

    /// The watch subscription could not be (re)established
    #[error("Watch failed: {0}")]
    WatchFailed(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// How the controller reacts to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry the key with exponential backoff
    Transient,
    /// Park the key until its desired state changes
    Permanent,
    /// Stop the controller
    Fatal,
}

/// Classify an HTTP status code returned by the API server.
pub fn classify_status(code: u16) -> ErrorClass {
    match code {
        // Bad request / unprocessable: the object we sent will never be accepted
        400 | 422 => ErrorClass::Permanent,
        401 | 403 => ErrorClass::Fatal,
        // 404 on a list/get races with deletion, 409 is an optimistic-lock conflict,
        // 410 is an expired watch resource version
        404 | 408 | 409 | 410 | 429 => ErrorClass::Transient,
        500..=599 => ErrorClass::Transient,
        _ => ErrorClass::Transient,
    }
}

fn classify_kube_error(err: &kube::Error) -> ErrorClass {
    match err {
        kube::Error::Api(resp) => classify_status(resp.code),
        kube::Error::Auth(_) => ErrorClass::Fatal,
        kube::Error::InferConfig(_) => ErrorClass::Fatal,
        kube::Error::SerdeError(_) => ErrorClass::Permanent,
        _ => ErrorClass::Transient,
    }
}

impl OperatorError {
    /// Map this error onto the controller's retry policy
    pub fn class(&self) -> ErrorClass {
        match self {
            OperatorError::KubeError(e) => classify_kube_error(e),
            OperatorError::Api { code, .. } => classify_status(*code),
            OperatorError::NotFound { .. } => ErrorClass::Transient,
            OperatorError::InvalidConfig(_)
            | OperatorError::ValidationError(_)
            | OperatorError::SerializationError(_)
            | OperatorError::YamlError(_) => ErrorClass::Permanent,
            OperatorError::Timeout(_) | OperatorError::Cancelled => ErrorClass::Transient,
            OperatorError::WatchFailed(_) => ErrorClass::Fatal,
            OperatorError::Internal(_) => ErrorClass::Transient,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Check if this error only reports cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OperatorError::Cancelled)
    }

    /// Check if the API server reported the object as missing
    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            OperatorError::Api { code, .. } => *code == 404,
            OperatorError::NotFound { .. } => true,
            _ => false,
        }
    }
}
