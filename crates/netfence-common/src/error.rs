//! Error types for netfence
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant maps to one failure category of the reconciliation core:
//! building the desired object graph, talking to the networking backend and
//! the initial cache warm-up.

use thiserror::Error;

/// Main error type for netfence operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The SecurityPolicy could not be translated into backend objects
    #[error("build error for {policy}: {message}")]
    Build {
        /// Name of the SecurityPolicy being translated
        policy: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.rules[0].ports[1]")
        field: Option<String>,
    },

    /// Networking backend request failed
    #[error("backend error [{operation}]: {message}")]
    Backend {
        /// Backend operation that failed (e.g., "patch_infra", "list_groups")
        operation: String,
        /// HTTP status code, when the backend answered at all
        status: Option<u16>,
        /// Description of what failed
        message: String,
    },

    /// Initial listing of one object kind failed
    #[error("initial sync of {kind} failed: {source}")]
    Sync {
        /// Object kind whose listing failed
        kind: String,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The object kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "sync", "controller")
        context: String,
    },
}

impl Error {
    /// Create a build error for the named SecurityPolicy
    pub fn build(policy: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Build {
            policy: policy.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a build error pointing at a specific field
    pub fn build_for_field(
        policy: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Build {
            policy: policy.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a backend error without an HTTP status (transport failure)
    pub fn backend(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            status: None,
            message: msg.into(),
        }
    }

    /// Create a backend error for a non-success HTTP response
    pub fn backend_status(
        operation: impl Into<String>,
        status: u16,
        msg: impl Into<String>,
    ) -> Self {
        Self::Backend {
            operation: operation.into(),
            status: Some(status),
            message: msg.into(),
        }
    }

    /// Wrap an error raised while listing `kind` during initial sync
    pub fn sync(kind: impl Into<String>, source: Error) -> Self {
        Self::Sync {
            kind: kind.into(),
            source: Box::new(source),
        }
    }

    /// Create a serialization error with object kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Build and serialization errors need an input change. Backend errors
    /// are retryable unless the backend rejected the request (4xx).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Build { .. } => false,
            Error::Backend { status, .. } => !matches!(status, Some(code) if (400..500).contains(code)),
            Error::Sync { source, .. } => source.is_retryable(),
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the SecurityPolicy name if this error is tied to one
    pub fn policy(&self) -> Option<&str> {
        match self {
            Error::Build { policy, .. } => Some(policy),
            _ => None,
        }
    }

    /// HTTP status reported by the backend, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Backend { status, .. } => *status,
            Error::Sync { source, .. } => source.status(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
            kind: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: an invalid SecurityPolicy surfaces as a non-retryable build error
    #[test]
    fn story_build_errors_need_input_change() {
        let err = Error::build_for_field("web-allow", "spec.rules[0]", "appliedTo is required");
        assert!(err.to_string().contains("web-allow"));
        assert!(err.to_string().contains("appliedTo"));
        assert_eq!(err.policy(), Some("web-allow"));
        assert!(!err.is_retryable());

        match &err {
            Error::Build { field, .. } => assert_eq!(field.as_deref(), Some("spec.rules[0]")),
            _ => panic!("Expected Build variant"),
        }
    }

    /// Story: backend rejections are terminal, transport failures are not
    #[test]
    fn story_backend_error_retryability() {
        assert!(Error::backend("patch_infra", "connection reset").is_retryable());
        assert!(Error::backend_status("patch_infra", 503, "unavailable").is_retryable());
        assert!(!Error::backend_status("patch_infra", 400, "invalid rule").is_retryable());
        assert!(!Error::backend_status("patch_infra", 403, "forbidden").is_retryable());
    }

    /// Story: sync errors keep the kind that failed and the backend detail
    #[test]
    fn story_sync_error_wraps_listing_failure() {
        let err = Error::sync("group", Error::backend_status("list_groups", 500, "boom"));
        assert!(err.to_string().contains("initial sync of group failed"));
        assert!(err.to_string().contains("boom"));
        assert_eq!(err.status(), Some(500));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_internal_error_carries_context() {
        let err = Error::internal_with_context("sync", "unexpected state");
        assert!(err.to_string().contains("[sync]"));
        assert!(err.is_retryable());
        assert_eq!(err.policy(), None);
    }

    #[test]
    fn test_serde_json_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(!err.is_retryable());
    }
}
