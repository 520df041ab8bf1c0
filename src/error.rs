//! Error types for the profile state controller

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A reconciliation key that can never resolve to a namespace
    #[error("invalid reconciliation key: {0}")]
    InvalidKey(String),

    /// Configuration could not be loaded or is out of range
    #[error("configuration error: {0}")]
    Config(String),

    /// The Profile exists but its Namespace is not in the cache yet
    #[error("namespace {0} not found for existing profile")]
    NamespaceMissing(String),

    /// Unexpected failure caught at the worker boundary
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid key error with the given message
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The API server answered 404 for the target object
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// The API server rejected a write carrying a stale resource version
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Retrying can never succeed; the key is dropped instead of requeued
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::InvalidKey(_))
    }

    /// Short, low-cardinality class name for metrics and logs
    pub fn class(&self) -> &'static str {
        match self {
            Self::Kube(_) if self.is_conflict() => "conflict",
            Self::Kube(_) if self.is_not_found() => "not_found",
            Self::Kube(_) => "kube",
            Self::InvalidKey(_) => "invalid_key",
            Self::Config(_) => "config",
            Self::NamespaceMissing(_) => "namespace_missing",
            Self::Internal(_) => "internal",
        }
    }

    fn api_code(&self) -> Option<u16> {
        match self {
            Self::Kube(kube::Error::Api(response)) => Some(response.code),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("test {reason}"),
        reason: reason.to_string(),
        code,
    }))
}
