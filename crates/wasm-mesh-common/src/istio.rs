//! Istio EnvoyFilter types
//!
//! Only the subset of `networking.istio.io/v1alpha3` EnvoyFilter needed to
//! splice an HTTP filter into a sidecar's listener filter chain.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::kube_utils::{HasApiResource, ObjectMeta};

/// Name of the HTTP connection manager network filter
pub const HTTP_CONNECTION_MANAGER: &str = "envoy.http_connection_manager";

/// Name of the terminal router HTTP filter
pub const ROUTER_FILTER: &str = "envoy.router";

/// Istio EnvoyFilter custom resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyFilter {
    /// API version
    #[serde(default = "EnvoyFilter::api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "EnvoyFilter::kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: EnvoyFilterSpec,
}

impl HasApiResource for EnvoyFilter {
    const API_VERSION: &'static str = "networking.istio.io/v1alpha3";
    const KIND: &'static str = "EnvoyFilter";
}

impl EnvoyFilter {
    fn api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }
    fn kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Create a new EnvoyFilter
    pub fn new(metadata: ObjectMeta, spec: EnvoyFilterSpec) -> Self {
        Self {
            api_version: Self::api_version(),
            kind: Self::kind(),
            metadata,
            spec,
        }
    }
}

/// EnvoyFilter spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyFilterSpec {
    /// Pods the patches apply to; `None` applies to every proxy in the namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_selector: Option<WorkloadSelector>,

    /// Patches to the generated Envoy configuration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_patches: Vec<EnvoyConfigObjectPatch>,
}

/// Label-based pod selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkloadSelector {
    /// Pod labels to match
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A single patch: where to apply it, what to match and what to do
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyConfigObjectPatch {
    /// Kind of Envoy config object the patch targets
    pub apply_to: ApplyTo,
    /// Which objects of that kind to patch
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_: Option<EnvoyConfigObjectMatch>,
    /// The change itself
    pub patch: EnvoyPatch,
}

/// Envoy config object kinds we patch
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyTo {
    /// An HTTP filter inside the HTTP connection manager
    HttpFilter,
}

/// Traffic direction at which a patch applies
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchContext {
    /// Sidecars and gateways alike
    Any,
    /// Sidecar listeners for inbound traffic
    SidecarInbound,
    /// Sidecar listeners for outbound traffic
    SidecarOutbound,
    /// Gateway proxies
    Gateway,
}

impl fmt::Display for PatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PatchContext::Any => "ANY",
            PatchContext::SidecarInbound => "SIDECAR_INBOUND",
            PatchContext::SidecarOutbound => "SIDECAR_OUTBOUND",
            PatchContext::Gateway => "GATEWAY",
        };
        f.write_str(s)
    }
}

/// Match criteria for a patch
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EnvoyConfigObjectMatch {
    /// Traffic direction
    pub context: PatchContext,
    /// Listener to match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener: Option<ListenerMatch>,
}

/// Listener match
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerMatch {
    /// Filter chain within the listener
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_chain: Option<FilterChainMatch>,
}

/// Filter chain match
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FilterChainMatch {
    /// Network filter within the chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterMatch>,
}

/// Network filter match
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilterMatch {
    /// Network filter name
    pub name: String,
    /// HTTP filter inside the network filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_filter: Option<SubFilterMatch>,
}

/// HTTP filter match
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SubFilterMatch {
    /// HTTP filter name
    pub name: String,
}

/// Patch operation and payload
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EnvoyPatch {
    /// What to do relative to the matched object
    pub operation: PatchOperation,
    /// Opaque Envoy config to insert
    pub value: serde_json::Value,
}

/// Patch operations we emit
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchOperation {
    /// Insert the value before the matched object
    InsertBefore,
}

impl EnvoyConfigObjectMatch {
    /// Match the router filter inside the HTTP connection manager of any
    /// listener at `context`
    pub fn before_router(context: PatchContext) -> Self {
        Self {
            context,
            listener: Some(ListenerMatch {
                filter_chain: Some(FilterChainMatch {
                    filter: Some(FilterMatch {
                        name: HTTP_CONNECTION_MANAGER.to_string(),
                        sub_filter: Some(SubFilterMatch {
                            name: ROUTER_FILTER.to_string(),
                        }),
                    }),
                }),
            }),
        }
    }
}
