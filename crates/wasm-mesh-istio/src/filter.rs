//! Filter description and image collaborators

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use wasm_mesh_common::{Error, Result};

#[cfg(test)]
use mockall::automock;

/// Host directory shared by the cache DaemonSet and every sidecar
pub const CACHE_DIR: &str = "/var/local/lib/wasm-cache";

/// A filter to deploy
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
    /// Unique id; also the suffix of the generated EnvoyFilter name
    pub id: String,
    /// Image reference holding the filter binary
    pub image: String,
    /// Opaque configuration string handed to the filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    /// Root id inside the module, if it exports several
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_id: Option<String>,
    /// Patch context token: any, inbound, outbound or gateway
    #[serde(default)]
    pub patch_context: String,
}

/// Runtime config embedded in a filter image
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    /// ABI versions the binary was built against
    #[serde(default)]
    pub abi_versions: Vec<String>,
}

/// Handle to a pulled image
#[derive(Clone, Debug, PartialEq)]
pub struct PulledImage {
    /// The reference that was pulled
    pub reference: String,
    /// Content digest of the image descriptor, e.g. `sha256:ab12...`
    pub digest: String,
}

/// Pulls filter images and reads their embedded config
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImagePuller: Send + Sync {
    /// Pull `reference`, returning a handle carrying its descriptor digest
    async fn pull(&self, reference: &str) -> Result<PulledImage>;

    /// Read the runtime config embedded in a pulled image
    async fn fetch_config(&self, image: &PulledImage) -> Result<ImageConfig>;
}

/// Path where the cache stores the binary for `digest`
///
/// The algorithm prefix is dropped: `sha256:ab12` becomes
/// `/var/local/lib/wasm-cache/ab12.wasm`.
pub fn cached_binary_path(digest: &str) -> Result<String> {
    let (algorithm, hex) = digest.split_once(':').ok_or_else(|| {
        Error::validation_for_field(
            "digest",
            format!("digest {:?} has no algorithm prefix", digest),
        )
    })?;
    if algorithm.is_empty() || hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::validation_for_field(
            "digest",
            format!("digest {:?} is not of the form <algorithm>:<hex>", digest),
        ));
    }
    Ok(format!("{}/{}.wasm", CACHE_DIR, hex))
}
