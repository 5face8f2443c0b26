//! EnvoyFilter construction
//!
//! Builds the single config patch that inserts the Wasm HTTP filter before
//! the router of every listener matching the patch context.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use wasm_mesh_common::istio::{
    ApplyTo, EnvoyConfigObjectMatch, EnvoyConfigObjectPatch, EnvoyFilter, EnvoyFilterSpec,
    EnvoyPatch, PatchContext, PatchOperation, WorkloadSelector,
};
use wasm_mesh_common::kube_utils::ObjectMeta;
use wasm_mesh_common::{Error, Result};

use crate::filter::FilterSpec;
use crate::version::SchemaGeneration;

/// Envoy name of the Wasm HTTP filter
pub const WASM_FILTER_NAME: &str = "envoy.filters.http.wasm";
/// Wasm runtime used for every filter
pub const WASM_RUNTIME_V8: &str = "envoy.wasm.runtime.v8";

const TYPED_STRUCT_TYPE: &str = "type.googleapis.com/udpa.type.v1.TypedStruct";
const WASM_V3_TYPE: &str = "type.googleapis.com/envoy.extensions.filters.http.wasm.v3.Wasm";
const STRING_VALUE_TYPE: &str = "type.googleapis.com/google.protobuf.StringValue";

/// Patch context tokens accepted on a [`FilterSpec`]
pub const SUPPORTED_PATCH_CONTEXTS: [&str; 4] = ["any", "inbound", "outbound", "gateway"];

/// Resolve a patch context token (case-insensitive, empty means inbound)
pub fn resolve_patch_context(token: &str) -> Result<PatchContext> {
    match token.to_lowercase().as_str() {
        "any" => Ok(PatchContext::Any),
        "inbound" | "" => Ok(PatchContext::SidecarInbound),
        "outbound" => Ok(PatchContext::SidecarOutbound),
        "gateway" => Ok(PatchContext::Gateway),
        _ => Err(Error::validation_for_field(
            "patchContext",
            format!(
                "unknown patch context {}, must be one of the following values: {}",
                token,
                SUPPORTED_PATCH_CONTEXTS.join(", ")
            ),
        )),
    }
}

/// Name of the EnvoyFilter owned by `workload_name` for filter `filter_id`
pub fn envoy_filter_name(workload_name: &str, filter_id: &str) -> String {
    format!("{}-{}", workload_name, filter_id)
}

/// HTTP filter config for the Wasm filter, in the wire shape of `schema`
pub fn build_wasm_filter(
    filter: &FilterSpec,
    cached_binary_path: &str,
    schema: SchemaGeneration,
) -> Value {
    match schema {
        SchemaGeneration::Legacy => {
            let mut config = Map::new();
            config.insert("name".into(), json!(filter.id));
            if let Some(root_id) = &filter.root_id {
                config.insert("rootId".into(), json!(root_id));
            }
            config.insert(
                "vmConfig".into(),
                json!({
                    "vmId": filter.id,
                    "runtime": WASM_RUNTIME_V8,
                    "code": {"local": {"filename": cached_binary_path}},
                }),
            );
            if let Some(configuration) = &filter.config {
                config.insert("configuration".into(), json!(configuration));
            }
            json!({
                "name": WASM_FILTER_NAME,
                "config": {"config": config},
            })
        }
        SchemaGeneration::Typed => {
            let mut config = Map::new();
            config.insert("name".into(), json!(filter.id));
            if let Some(root_id) = &filter.root_id {
                config.insert("root_id".into(), json!(root_id));
            }
            config.insert(
                "vm_config".into(),
                json!({
                    "vm_id": filter.id,
                    "runtime": WASM_RUNTIME_V8,
                    "code": {"local": {"filename": cached_binary_path}},
                }),
            );
            if let Some(configuration) = &filter.config {
                config.insert(
                    "configuration".into(),
                    json!({"@type": STRING_VALUE_TYPE, "value": configuration}),
                );
            }
            json!({
                "name": WASM_FILTER_NAME,
                "typed_config": {
                    "@type": TYPED_STRUCT_TYPE,
                    "type_url": WASM_V3_TYPE,
                    "value": {"config": config},
                },
            })
        }
    }
}

/// Builds EnvoyFilters for workloads in one namespace
#[derive(Clone, Debug)]
pub struct ConfigPatchBuilder {
    namespace: String,
}

impl ConfigPatchBuilder {
    /// Builder for EnvoyFilters living in `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Build the EnvoyFilter that adds `filter` to the pods of `workload_name`
    pub fn build(
        &self,
        filter: &FilterSpec,
        cached_binary_path: &str,
        schema: SchemaGeneration,
        workload_name: &str,
        workload_labels: &BTreeMap<String, String>,
    ) -> Result<EnvoyFilter> {
        let context = resolve_patch_context(&filter.patch_context)?;
        let value = build_wasm_filter(filter, cached_binary_path, schema);

        let spec = EnvoyFilterSpec {
            workload_selector: Some(WorkloadSelector {
                labels: workload_labels.clone(),
            }),
            config_patches: vec![EnvoyConfigObjectPatch {
                apply_to: ApplyTo::HttpFilter,
                match_: Some(EnvoyConfigObjectMatch::before_router(context)),
                patch: EnvoyPatch {
                    operation: PatchOperation::InsertBefore,
                    value,
                },
            }],
        };

        Ok(EnvoyFilter::new(
            ObjectMeta::new(
                envoy_filter_name(workload_name, &filter.id),
                self.namespace.clone(),
            ),
            spec,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_mesh_common::ErrorCategory;

    const PATH: &str = "/var/local/lib/wasm-cache/abc123.wasm";

    fn spec(context: &str) -> FilterSpec {
        FilterSpec {
            id: "add-header".to_string(),
            image: "webassemblyhub.io/example/add-header:v0.1".to_string(),
            config: Some("{\"header\":\"x-hello\"}".to_string()),
            root_id: Some("add_header".to_string()),
            patch_context: context.to_string(),
        }
    }

    fn labels() -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "reviews".to_string());
        labels.insert("version".to_string(), "v1".to_string());
        labels
    }

    #[test]
    fn name_is_workload_dash_filter_id() {
        assert_eq!(envoy_filter_name("reviews-v1", "add-header"), "reviews-v1-add-header");
        let filter = ConfigPatchBuilder::new("bookinfo")
            .build(&spec(""), PATH, SchemaGeneration::Typed, "reviews-v1", &labels())
            .unwrap();
        assert_eq!(filter.metadata.name, "reviews-v1-add-header");
        assert_eq!(filter.metadata.namespace, "bookinfo");
    }

    #[test]
    fn patch_contexts_resolve_case_insensitively() {
        assert_eq!(resolve_patch_context("").unwrap(), PatchContext::SidecarInbound);
        assert_eq!(resolve_patch_context("Inbound").unwrap(), PatchContext::SidecarInbound);
        assert_eq!(resolve_patch_context("OUTBOUND").unwrap(), PatchContext::SidecarOutbound);
        assert_eq!(resolve_patch_context("any").unwrap(), PatchContext::Any);
        assert_eq!(resolve_patch_context("Gateway").unwrap(), PatchContext::Gateway);
    }

    #[test]
    fn unknown_patch_context_lists_valid_values() {
        let err = resolve_patch_context("sidecar").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
        let msg = err.to_string();
        assert!(msg.contains("sidecar"));
        assert!(msg.contains("any, inbound, outbound, gateway"));

        let err = ConfigPatchBuilder::new("bookinfo")
            .build(&spec("sidecar"), PATH, SchemaGeneration::Typed, "reviews-v1", &labels())
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[test]
    fn single_patch_inserted_before_router() {
        let filter = ConfigPatchBuilder::new("bookinfo")
            .build(&spec("outbound"), PATH, SchemaGeneration::Typed, "reviews-v1", &labels())
            .unwrap();
        assert_eq!(filter.spec.workload_selector.as_ref().unwrap().labels, labels());
        assert_eq!(filter.spec.config_patches.len(), 1);

        let json = serde_json::to_value(&filter.spec.config_patches[0]).unwrap();
        assert_eq!(json["applyTo"], "HTTP_FILTER");
        assert_eq!(json["match"]["context"], "SIDECAR_OUTBOUND");
        assert_eq!(
            json["match"]["listener"]["filterChain"]["filter"]["subFilter"]["name"],
            "envoy.router"
        );
        assert_eq!(json["patch"]["operation"], "INSERT_BEFORE");
    }

    #[test]
    fn typed_filter_shape() {
        let value = build_wasm_filter(&spec(""), PATH, SchemaGeneration::Typed);
        assert_eq!(
            value,
            json!({
                "name": "envoy.filters.http.wasm",
                "typed_config": {
                    "@type": "type.googleapis.com/udpa.type.v1.TypedStruct",
                    "type_url": "type.googleapis.com/envoy.extensions.filters.http.wasm.v3.Wasm",
                    "value": {
                        "config": {
                            "name": "add-header",
                            "root_id": "add_header",
                            "vm_config": {
                                "vm_id": "add-header",
                                "runtime": "envoy.wasm.runtime.v8",
                                "code": {"local": {"filename": PATH}}
                            },
                            "configuration": {
                                "@type": "type.googleapis.com/google.protobuf.StringValue",
                                "value": "{\"header\":\"x-hello\"}"
                            }
                        }
                    }
                }
            })
        );
    }

    #[test]
    fn legacy_filter_shape() {
        let value = build_wasm_filter(&spec(""), PATH, SchemaGeneration::Legacy);
        assert_eq!(
            value,
            json!({
                "name": "envoy.filters.http.wasm",
                "config": {
                    "config": {
                        "name": "add-header",
                        "rootId": "add_header",
                        "vmConfig": {
                            "vmId": "add-header",
                            "runtime": "envoy.wasm.runtime.v8",
                            "code": {"local": {"filename": PATH}}
                        },
                        "configuration": "{\"header\":\"x-hello\"}"
                    }
                }
            })
        );
    }

    #[test]
    fn optional_fields_are_omitted() {
        let filter = FilterSpec {
            id: "bare".to_string(),
            ..Default::default()
        };
        let value = build_wasm_filter(&filter, PATH, SchemaGeneration::Typed);
        let config = &value["typed_config"]["value"]["config"];
        assert!(config.get("root_id").is_none());
        assert!(config.get("configuration").is_none());

        let value = build_wasm_filter(&filter, PATH, SchemaGeneration::Legacy);
        let config = &value["config"]["config"];
        assert!(config.get("rootId").is_none());
        assert!(config.get("configuration").is_none());
    }

    #[test]
    fn generated_filter_is_labelled_managed() {
        let filter = ConfigPatchBuilder::new("bookinfo")
            .build(&spec(""), PATH, SchemaGeneration::Legacy, "reviews-v1", &labels())
            .unwrap();
        assert_eq!(
            filter
                .metadata
                .labels
                .get(wasm_mesh_common::LABEL_MANAGED_BY)
                .map(String::as_str),
            Some("wasm-mesh")
        );
    }
}
