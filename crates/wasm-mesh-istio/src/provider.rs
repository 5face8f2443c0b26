//! Filter deployment to Istio workloads
//!
//! [`IstioProvider`] ties the pieces together. Applying a filter pulls its
//! image, gates on ABI compatibility, publishes the image to the shared
//! cache and waits for every replica to fetch it, then for each selected
//! workload merges the sidecar annotations and applies an EnvoyFilter.
//! Removing a filter reverses the annotations and deletes the EnvoyFilters.
//!
//! Workloads are processed one at a time and the first failure aborts the
//! operation. Nothing already mutated is rolled back; every mutation is
//! idempotent so re-running a failed operation converges.

use std::path::Path;
use std::sync::Arc;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Client;
use tracing::{debug, info, instrument, warn};
use wasm_mesh_common::kube_utils::create_client;
use wasm_mesh_common::{Error, Result, ResultExt};

use crate::abi::{AbiRegistry, DefaultAbiRegistry};
use crate::annotations::AnnotationMerger;
use crate::cache::{CacheStore, CacheStoreImpl, CacheSynchronizer};
use crate::config::ProviderConfig;
use crate::ensurer::{ResourceEnsurer, ResourceEnsurerImpl};
use crate::filter::{cached_binary_path, FilterSpec, ImagePuller};
use crate::patch::{envoy_filter_name, ConfigPatchBuilder};
use crate::version::{select_schema, SchemaGeneration, VersionGate, VersionLookup, VersionLookupImpl};
use crate::workloads::{WorkloadSelector, WorkloadStore, WorkloadStoreImpl};

/// Called once per workload during [`IstioProvider::apply_filter`] with the
/// workload metadata and the error that workload failed with, if any
pub type WorkloadCallback = Arc<dyn Fn(&ObjectMeta, Option<&Error>) + Send + Sync>;

/// External systems the provider talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Fetches filter images
    pub puller: Arc<dyn ImagePuller>,
    /// Reports the control-plane version
    pub version_lookup: Arc<dyn VersionLookup>,
    /// Decides ABI compatibility
    pub abi_registry: Arc<dyn AbiRegistry>,
    /// Cache registry and events
    pub cache_store: Arc<dyn CacheStore>,
    /// Target workloads
    pub workload_store: Arc<dyn WorkloadStore>,
    /// EnvoyFilter persistence
    pub ensurer: Arc<dyn ResourceEnsurer>,
}

impl Collaborators {
    /// Kubernetes-backed collaborators sharing `client`
    pub fn from_client(
        client: Client,
        puller: Arc<dyn ImagePuller>,
        field_manager: impl Into<String>,
    ) -> Self {
        Self {
            puller,
            version_lookup: Arc::new(VersionLookupImpl::new(client.clone())),
            abi_registry: Arc::new(DefaultAbiRegistry::default()),
            cache_store: Arc::new(CacheStoreImpl::new(client.clone())),
            workload_store: Arc::new(WorkloadStoreImpl::new(client.clone())),
            ensurer: Arc::new(ResourceEnsurerImpl::new(client, field_manager)),
        }
    }
}

/// Deploys Wasm filters to the workloads selected by a [`ProviderConfig`]
pub struct IstioProvider {
    config: ProviderConfig,
    puller: Arc<dyn ImagePuller>,
    version_gate: VersionGate,
    cache: CacheSynchronizer,
    workloads: WorkloadSelector,
    ensurer: Arc<dyn ResourceEnsurer>,
    annotations: AnnotationMerger,
    patches: ConfigPatchBuilder,
    owner: Option<OwnerReference>,
    on_workload: Option<WorkloadCallback>,
}

impl IstioProvider {
    /// Create a provider; fails if `config` does not validate
    pub fn new(config: ProviderConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            version_gate: VersionGate::new(
                collaborators.version_lookup,
                collaborators.abi_registry,
                config.istio_namespace.clone(),
                config.ignore_version_check,
            ),
            cache: CacheSynchronizer::new(collaborators.cache_store, config.cache_poll_interval)?,
            workloads: WorkloadSelector::new(collaborators.workload_store),
            ensurer: collaborators.ensurer,
            puller: collaborators.puller,
            annotations: AnnotationMerger::default(),
            patches: ConfigPatchBuilder::new(config.workload.namespace.clone()),
            owner: None,
            on_workload: None,
            config,
        })
    }

    /// Create a provider talking to the cluster behind `client`
    pub fn from_client(
        client: Client,
        puller: Arc<dyn ImagePuller>,
        config: ProviderConfig,
    ) -> Result<Self> {
        let collaborators = Collaborators::from_client(client, puller, config.field_manager.clone());
        Self::new(config, collaborators)
    }

    /// Connect using `kubeconfig`, or the inferred cluster config if `None`
    pub async fn connect(
        kubeconfig: Option<&Path>,
        puller: Arc<dyn ImagePuller>,
        config: ProviderConfig,
    ) -> Result<Self> {
        let client = create_client(kubeconfig).await?;
        Self::from_client(client, puller, config)
    }

    /// Parent created EnvoyFilters to `owner`
    ///
    /// Garbage collection of owned filters is left to Kubernetes, so
    /// [`remove_filter`](Self::remove_filter) no longer deletes them.
    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Register a per-workload result callback
    pub fn on_workload(
        mut self,
        callback: impl Fn(&ObjectMeta, Option<&Error>) + Send + Sync + 'static,
    ) -> Self {
        self.on_workload = Some(Arc::new(callback));
        self
    }

    /// The configuration this provider was built with
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Deploy `filter` to every selected workload
    #[instrument(skip(self, filter), fields(filter = %filter.id, image = %filter.image))]
    pub async fn apply_filter(&self, filter: &FilterSpec) -> Result<()> {
        validate_filter(filter)?;
        info!(
            namespace = %self.config.workload.namespace,
            kind = %self.config.workload.kind,
            "applying filter to one or more workloads"
        );

        let image = self
            .puller
            .pull(&filter.image)
            .await
            .context("pulling filter image")?;
        let image_config = self
            .puller
            .fetch_config(&image)
            .await
            .context("fetching filter image config")?;

        let istio_version = self.version_gate.get_version().await?;
        if self.config.ignore_version_check {
            warn!(image = %filter.image, "ignoreVersionCheck is set, skipping ABI version check");
        }
        self.version_gate
            .validate_abi(&filter.image, &image_config.abi_versions, &istio_version)?;

        let binary_path = cached_binary_path(&image.digest)?;

        self.sync_cache(&filter.image)
            .await
            .context("adding image to cache")?;

        let schema = select_schema(&istio_version);
        debug!(istio_version = %istio_version, schema = %schema, "selected filter schema");

        let binary_path = binary_path.as_str();
        let target = &self.config.workload;
        self.workloads
            .list_and_mutate_with(
                target.kind,
                &target.namespace,
                &target.labels,
                move |meta, template| async move {
                    self.apply_to_workload(filter, binary_path, schema, &meta, template)
                        .await
                },
                |meta, err| {
                    if let Some(callback) = &self.on_workload {
                        callback(meta, err);
                    }
                },
            )
            .await
            .context("applying filter to workload")?;

        Ok(())
    }

    /// Publish `image` and, if it is new, wait for the cache replicas
    ///
    /// Events are cleaned up even when the wait fails.
    async fn sync_cache(&self, image: &str) -> Result<()> {
        let cache = &self.config.cache;
        if !self.cache.publish(cache, image).await? {
            return Ok(());
        }

        let waited = self
            .cache
            .await_acknowledgment(cache, image, self.config.cache_timeout)
            .await
            .context("waiting for cache to publish event for image");
        let cleaned = self
            .cache
            .cleanup(cache, image)
            .await
            .context("cleaning up cache events for image");

        match (waited, cleaned) {
            (Err(wait_err), Err(cleanup_err)) => {
                warn!(image = %image, error = %cleanup_err, "failed to clean up cache events");
                Err(wait_err)
            }
            (Err(wait_err), Ok(())) => Err(wait_err),
            (Ok(()), cleaned) => cleaned,
        }
    }

    async fn apply_to_workload(
        &self,
        filter: &FilterSpec,
        binary_path: &str,
        schema: SchemaGeneration,
        meta: &ObjectMeta,
        mut template: PodTemplateSpec,
    ) -> Result<PodTemplateSpec> {
        let workload = meta.name.as_deref().unwrap_or_default();

        self.annotations.apply(&mut template)?;
        info!(workload = %workload, "updated workload sidecar annotations");

        let labels = template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        let mut envoy_filter = self
            .patches
            .build(filter, binary_path, schema, workload, &labels)?;
        if let Some(owner) = &self.owner {
            envoy_filter.metadata = envoy_filter.metadata.with_owner(owner.clone());
        }

        self.ensurer.ensure_envoy_filter(&envoy_filter).await?;
        info!(
            workload = %workload,
            envoy_filter = %envoy_filter.metadata.name,
            "created Istio EnvoyFilter resource"
        );
        Ok(template)
    }

    /// Remove `filter` from every selected workload
    #[instrument(skip(self, filter), fields(filter = %filter.id))]
    pub async fn remove_filter(&self, filter: &FilterSpec) -> Result<()> {
        validate_filter(filter)?;
        let target = &self.config.workload;
        info!(
            namespace = %target.namespace,
            kind = %target.kind,
            "removing filter from one or more workloads"
        );

        let updated = self
            .workloads
            .list_and_mutate(target.kind, &target.namespace, &target.labels, move |meta, mut template| async move {
                self.annotations.remove(&mut template);
                info!(
                    workload = %meta.name.as_deref().unwrap_or_default(),
                    "removed sidecar annotations from workload"
                );
                Ok(template)
            })
            .await
            .context("removing annotations from workload")?;

        if self.owner.is_some() {
            debug!("EnvoyFilters are owned, leaving them to garbage collection");
            return Ok(());
        }

        for meta in updated {
            let workload = meta.name.as_deref().unwrap_or_default();
            let name = envoy_filter_name(workload, &filter.id);
            self.ensurer
                .delete_envoy_filter(&target.namespace, &name)
                .await
                .with_context(|| format!("deleting EnvoyFilter {}", name))?;
            info!(workload = %workload, envoy_filter = %name, "deleted Istio EnvoyFilter resource");
        }
        Ok(())
    }
}

fn validate_filter(filter: &FilterSpec) -> Result<()> {
    if filter.id.is_empty() {
        return Err(Error::validation_for_field("id", "filter id must not be empty"));
    }
    if filter.image.is_empty() {
        return Err(Error::validation_for_field("image", "filter image must not be empty"));
    }
    Ok(())
}
