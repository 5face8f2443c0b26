//! EnvoyFilter persistence

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::Client;
use tracing::debug;
use wasm_mesh_common::istio::EnvoyFilter;
use wasm_mesh_common::kube_utils::{ignore_not_found, HasApiResource};
use wasm_mesh_common::{Error, Result};

#[cfg(test)]
use mockall::automock;

/// Creates, updates and deletes EnvoyFilters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceEnsurer: Send + Sync {
    /// Create or update `filter`, keyed by its name and namespace
    ///
    /// Owner references set on the filter metadata are applied with it.
    async fn ensure_envoy_filter(&self, filter: &EnvoyFilter) -> Result<()>;

    /// Delete an EnvoyFilter; an absent filter is not an error
    async fn delete_envoy_filter(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Real Kubernetes [`ResourceEnsurer`] using server-side apply
pub struct ResourceEnsurerImpl {
    client: Client,
    field_manager: String,
}

impl ResourceEnsurerImpl {
    /// Create an ensurer applying as `field_manager`
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &EnvoyFilter::api_resource())
    }
}

#[async_trait]
impl ResourceEnsurer for ResourceEnsurerImpl {
    async fn ensure_envoy_filter(&self, filter: &EnvoyFilter) -> Result<()> {
        let name = &filter.metadata.name;
        let namespace = &filter.metadata.namespace;
        let body = serde_json::to_value(filter)
            .map_err(|e| Error::serialization_for_kind("EnvoyFilter", e.to_string()))?;

        self.api(namespace)
            .patch(
                name,
                &PatchParams::apply(&self.field_manager).force(),
                &Patch::Apply(&body),
            )
            .await?;
        debug!(envoy_filter = %name, namespace = %namespace, "applied EnvoyFilter");
        Ok(())
    }

    async fn delete_envoy_filter(&self, namespace: &str, name: &str) -> Result<()> {
        let deleted = ignore_not_found(
            self.api(namespace)
                .delete(name, &DeleteParams::default())
                .await,
        )?;
        if deleted.is_none() {
            debug!(envoy_filter = %name, namespace = %namespace, "EnvoyFilter already absent");
        }
        Ok(())
    }
}
