//! Error types for wasm-mesh
//!
//! Errors carry structured fields so that callers can tell a bad filter spec
//! apart from an incompatible control plane, a cache that never acknowledged,
//! or a failing Kubernetes API call. Every stage wraps the errors it surfaces
//! with [`Error::Context`], producing chains such as
//! `applying filter to workload: validation error: ...`.

use std::time::Duration;

use thiserror::Error;

/// Main error type for wasm-mesh operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Failure reported by an external collaborator other than the kube client
    /// (image puller, version lookup, cache registry)
    #[error("upstream error [{context}]: {message}")]
    Upstream {
        /// Collaborator or stage that failed (e.g., "image-puller")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// A resource that must exist beforehand was not found
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind (e.g., "ConfigMap")
        kind: String,
        /// Resource name
        name: String,
        /// Resource namespace
        namespace: String,
    },

    /// Invalid input: unsupported workload kind, unknown patch context,
    /// malformed annotation JSON, bad configuration value
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field or key, if known
        field: Option<String>,
    },

    /// Filter image ABI does not match the control plane
    #[error("image {image} not supported by istio version {istio_version}: {message}")]
    Compatibility {
        /// Filter image reference
        image: String,
        /// Control-plane version that was checked
        istio_version: String,
        /// Why the registry rejected the pair
        message: String,
    },

    /// Cache replicas did not acknowledge an image before the deadline
    #[error("timed out after {timeout:?} waiting for cache events for {image} (last err: {last_mismatch})")]
    SyncTimeout {
        /// Image reference being waited on
        image: String,
        /// The configured deadline
        timeout: Duration,
        /// The last observed acknowledgment mismatch
        last_mismatch: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// An error wrapped with the stage in which it occurred
    #[error("{context}: {source}")]
    Context {
        /// Stage description (e.g., "adding image to cache")
        context: String,
        /// The wrapped error
        #[source]
        source: Box<Error>,
    },
}

/// Coarse classification of an [`Error`], independent of context wrapping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller-supplied input is invalid
    Validation,
    /// Filter ABI and control-plane version disagree
    Compatibility,
    /// Cache acknowledgment deadline exceeded
    SyncTimeout,
    /// An external system failed
    Upstream,
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error naming the offending field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an upstream error for a collaborator
    pub fn upstream(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Upstream {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for a namespaced resource
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Create a compatibility error
    pub fn compatibility(
        image: impl Into<String>,
        istio_version: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Compatibility {
            image: image.into(),
            istio_version: istio_version.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Wrap this error with the stage in which it occurred
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any context wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Classify the error for callers that only care about the failure family
    pub fn category(&self) -> ErrorCategory {
        match self.root() {
            Error::Validation { .. } | Error::Serialization { .. } => ErrorCategory::Validation,
            Error::Compatibility { .. } => ErrorCategory::Compatibility,
            Error::SyncTimeout { .. } => ErrorCategory::SyncTimeout,
            Error::Kube { .. } | Error::Upstream { .. } | Error::NotFound { .. } => {
                ErrorCategory::Upstream
            }
            Error::Context { .. } => unreachable!("root() never returns a context wrapper"),
        }
    }

    /// Check whether the error means a resource was missing
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Input and compatibility problems need a config change; upstream
    /// failures and timeouts may clear up on their own.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Upstream { .. } => true,
            Error::NotFound { .. } => false,
            Error::Validation { .. } => false,
            Error::Compatibility { .. } => false,
            Error::SyncTimeout { .. } => true,
            Error::Serialization { .. } => false,
            Error::Context { .. } => false,
        }
    }
}

/// Attach stage descriptions to fallible results
pub trait ResultExt<T> {
    /// Wrap the error (if any) with `context`
    fn context(self, context: impl Into<String>) -> Result<T, Error>;

    /// Wrap the error (if any) with a lazily built context
    fn with_context<F, S>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, context: impl Into<String>) -> Result<T, Error> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}
