//! Common types for wasm-mesh: errors, Kubernetes helpers, Istio resources

#![deny(missing_docs)]

pub mod error;
pub mod istio;
pub mod kube_utils;
pub mod telemetry;

pub use error::{Error, ErrorCategory, ResultExt};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key identifying the tool that manages a resource
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on resources created by wasm-mesh
pub const LABEL_MANAGED_BY_VALUE: &str = "wasm-mesh";

/// Default field manager for server-side apply
pub const DEFAULT_FIELD_MANAGER: &str = "wasm-mesh";
