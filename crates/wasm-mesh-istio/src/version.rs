//! Control-plane version gate
//!
//! Resolves the running Istio version, picks the EnvoyFilter schema
//! generation for it and checks filter ABI compatibility.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{debug, warn};
use wasm_mesh_common::{Error, Result, ResultExt};

use crate::abi::AbiRegistry;

#[cfg(test)]
use mockall::automock;

/// Label selectors identifying the istiod Deployment, tried in order
const ISTIOD_SELECTORS: [&str; 2] = ["app=istiod", "istio=pilot"];

/// First minor release that understands typed filter configuration
const TYPED_CONFIG_MINOR: u32 = 7;

/// Reports the control-plane version
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VersionLookup: Send + Sync {
    /// Dotted version of the control plane running in `namespace`
    async fn get_version(&self, namespace: &str) -> Result<String>;
}

/// Reads the version from the istiod image tag
pub struct VersionLookupImpl {
    client: Client,
}

impl VersionLookupImpl {
    /// Create a lookup using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VersionLookup for VersionLookupImpl {
    async fn get_version(&self, namespace: &str) -> Result<String> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        for selector in ISTIOD_SELECTORS {
            let list = api.list(&ListParams::default().labels(selector)).await?;
            let Some(deployment) = list.items.into_iter().next() else {
                continue;
            };
            let image = deployment
                .spec
                .and_then(|s| s.template.spec)
                .and_then(|s| s.containers.into_iter().next())
                .and_then(|c| c.image)
                .unwrap_or_default();
            debug!(namespace = %namespace, selector, image = %image, "found istiod deployment");
            return version_from_image(&image);
        }
        Err(Error::not_found("Deployment", namespace, "istiod"))
    }
}

/// Extract the version from an image reference tag
///
/// `docker.io/istio/pilot:1.8.2-distroless` yields `1.8.2`.
pub fn version_from_image(image: &str) -> Result<String> {
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    let tag = last_segment
        .split_once(':')
        .map(|(_, tag)| tag)
        .filter(|tag| !tag.is_empty())
        .ok_or_else(|| {
            Error::upstream(
                "version-lookup",
                format!("istiod image {:?} has no version tag", image),
            )
        })?;
    let version = tag.split('-').next().unwrap_or(tag);
    Ok(version.to_string())
}

/// Wire shape of the filter runtime configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaGeneration {
    /// Untyped `config` struct, understood by Istio before 1.7
    Legacy,
    /// `typed_config` TypedStruct, Istio 1.7 onwards
    Typed,
}

impl fmt::Display for SchemaGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaGeneration::Legacy => f.write_str("legacy"),
            SchemaGeneration::Typed => f.write_str("typed"),
        }
    }
}

/// Pick the schema generation for a control-plane version
///
/// Unparseable versions get [`SchemaGeneration::Typed`] with a warning.
pub fn select_schema(version: &str) -> SchemaGeneration {
    let minor = version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .nth(1)
        .and_then(|m| m.parse::<u32>().ok());
    match minor {
        Some(minor) if minor < TYPED_CONFIG_MINOR => SchemaGeneration::Legacy,
        Some(_) => SchemaGeneration::Typed,
        None => {
            warn!(version = %version, "could not parse istio minor version, assuming typed config");
            SchemaGeneration::Typed
        }
    }
}

/// Version lookup plus ABI gate
#[derive(Clone)]
pub struct VersionGate {
    lookup: Arc<dyn VersionLookup>,
    registry: Arc<dyn AbiRegistry>,
    istio_namespace: String,
    ignore_version_check: bool,
}

impl VersionGate {
    /// Create a gate for the control plane in `istio_namespace`
    pub fn new(
        lookup: Arc<dyn VersionLookup>,
        registry: Arc<dyn AbiRegistry>,
        istio_namespace: impl Into<String>,
        ignore_version_check: bool,
    ) -> Self {
        Self {
            lookup,
            registry,
            istio_namespace: istio_namespace.into(),
            ignore_version_check,
        }
    }

    /// Current control-plane version
    pub async fn get_version(&self) -> Result<String> {
        self.lookup
            .get_version(&self.istio_namespace)
            .await
            .context("getting istio version")
    }

    /// Check that `image` (built for `abi_versions`) can run on `istio_version`
    pub fn validate_abi(
        &self,
        image: &str,
        abi_versions: &[String],
        istio_version: &str,
    ) -> Result<()> {
        if self.ignore_version_check {
            return Ok(());
        }
        if abi_versions.is_empty() {
            warn!(
                image = %image,
                "image has no abi version specified, skipping compatibility check"
            );
            return Ok(());
        }
        self.registry
            .validate(abi_versions, istio_version)
            .map_err(|e| Error::compatibility(image, istio_version, e.to_string()))
    }
}
