//! Provider configuration
//!
//! Defaults suit a cache deployed as `wasm-cache/wasm-cache` next to an Istio
//! control plane in `istio-system`. [`ProviderConfig::from_env`] overlays
//! `WASM_MESH_*` environment variables on those defaults.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wasm_mesh_common::{Error, Result, DEFAULT_FIELD_MANAGER};

use crate::cache::CacheRef;
use crate::workloads::WorkloadKind;

/// Default namespace of the Istio control plane
pub const DEFAULT_ISTIO_NAMESPACE: &str = "istio-system";
/// Default name of the cache ConfigMap and DaemonSet
pub const DEFAULT_CACHE_NAME: &str = "wasm-cache";
/// Default namespace of the cache
pub const DEFAULT_CACHE_NAMESPACE: &str = "wasm-cache";
/// Default deadline for cache acknowledgments
pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(60);
/// Default interval between cache event polls
pub const DEFAULT_CACHE_POLL_INTERVAL: Duration = Duration::from_secs(1);

const ENV_ISTIO_NAMESPACE: &str = "WASM_MESH_ISTIO_NAMESPACE";
const ENV_CACHE_NAME: &str = "WASM_MESH_CACHE_NAME";
const ENV_CACHE_NAMESPACE: &str = "WASM_MESH_CACHE_NAMESPACE";
const ENV_CACHE_TIMEOUT_SECS: &str = "WASM_MESH_CACHE_TIMEOUT_SECS";
const ENV_IGNORE_VERSION_CHECK: &str = "WASM_MESH_IGNORE_VERSION_CHECK";

/// Workloads a filter is deployed to
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadTarget {
    /// Workload kind
    pub kind: WorkloadKind,
    /// Namespace to select workloads from
    pub namespace: String,
    /// Label selector; empty selects every workload of `kind` in `namespace`
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for WorkloadTarget {
    fn default() -> Self {
        Self {
            kind: WorkloadKind::Deployment,
            namespace: "default".to_string(),
            labels: BTreeMap::new(),
        }
    }
}

/// Everything the provider needs besides its collaborators
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Target workloads
    pub workload: WorkloadTarget,
    /// Shared binary cache
    pub cache: CacheRef,
    /// Namespace of the Istio control plane, used for the version lookup
    pub istio_namespace: String,
    /// Deploy even if the image ABI does not match the control plane
    pub ignore_version_check: bool,
    /// How long to wait for every cache replica to acknowledge a new image;
    /// zero skips the wait
    #[serde(with = "duration_secs")]
    pub cache_timeout: Duration,
    /// Interval between cache event polls
    #[serde(with = "duration_millis")]
    pub cache_poll_interval: Duration,
    /// Field manager for server-side apply
    pub field_manager: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            workload: WorkloadTarget::default(),
            cache: CacheRef::new(DEFAULT_CACHE_NAME, DEFAULT_CACHE_NAMESPACE),
            istio_namespace: DEFAULT_ISTIO_NAMESPACE.to_string(),
            ignore_version_check: false,
            cache_timeout: DEFAULT_CACHE_TIMEOUT,
            cache_poll_interval: DEFAULT_CACHE_POLL_INTERVAL,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
        }
    }
}

impl ProviderConfig {
    /// Defaults overlaid with `WASM_MESH_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(ns) = lookup(ENV_ISTIO_NAMESPACE) {
            config.istio_namespace = ns;
        }
        if let Some(name) = lookup(ENV_CACHE_NAME) {
            config.cache.name = name;
        }
        if let Some(ns) = lookup(ENV_CACHE_NAMESPACE) {
            config.cache.namespace = ns;
        }
        if let Some(raw) = lookup(ENV_CACHE_TIMEOUT_SECS) {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                Error::validation_for_field(
                    ENV_CACHE_TIMEOUT_SECS,
                    format!("expected whole seconds, got {:?}", raw),
                )
            })?;
            config.cache_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = lookup(ENV_IGNORE_VERSION_CHECK) {
            config.ignore_version_check = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => {
                    return Err(Error::validation_for_field(
                        ENV_IGNORE_VERSION_CHECK,
                        format!("expected a boolean, got {:?}", raw),
                    ))
                }
            };
        }

        Ok(config)
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.workload.namespace.is_empty() {
            return Err(Error::validation_for_field(
                "workload.namespace",
                "target namespace must not be empty",
            ));
        }
        if self.cache.name.is_empty() || self.cache.namespace.is_empty() {
            return Err(Error::validation_for_field(
                "cache",
                "cache name and namespace must not be empty",
            ));
        }
        if self.cache_poll_interval.is_zero() {
            return Err(Error::validation_for_field(
                "cachePollInterval",
                "poll interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
