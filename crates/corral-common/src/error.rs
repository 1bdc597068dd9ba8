//! Error types for the corral operator
//!
//! Errors carry a category the reconciler acts on: fatal configuration
//! problems, infrastructure that is absent, dependencies that are still
//! provisioning, and transient cluster API failures.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for corral operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Malformed desired state
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.regionDatabase.name")
        field: Option<String>,
    },

    /// Required infrastructure is entirely absent
    #[error("{kind} not found: {message}")]
    NotFound {
        /// Kind of the missing object (e.g., "volume", "secret")
        kind: String,
        /// Description of what was looked up
        message: String,
    },

    /// A dependency exists but is still provisioning
    #[error("not ready: {message}")]
    NotReady {
        /// What is being waited on
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "after")
        context: String,
    },

    /// The caller cancelled the pass
    #[error("reconciliation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not-found error for the given kind
    pub fn not_found(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create an ignorable not-ready error
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error only means "retry later"
    ///
    /// Ignorable errors are not surfaced as failures: they are logged at
    /// debug level and the object is requeued on a short interval.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Error::NotReady { .. } | Error::Cancelled)
    }

    /// Whether this error reports absent infrastructure
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec change. Missing
    /// infrastructure may be created out of band, so it is retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 404 && ae.code != 409
            ),
            Error::Validation { .. } => false,
            Error::NotFound { .. } => true,
            Error::NotReady { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
            Error::Cancelled => true,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
