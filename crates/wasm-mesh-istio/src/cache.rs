//! Shared binary cache synchronization
//!
//! The cache DaemonSet watches a registry ConfigMap listing filter images.
//! Each replica pulls new images onto its node and reports the outcome as a
//! Kubernetes Event. Before any workload references an image, the
//! orchestrator waits until every ready replica has reported success.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Event};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wasm_mesh_common::kube_utils::ignore_not_found;
use wasm_mesh_common::{Error, Result};

#[cfg(test)]
use mockall::automock;

/// ConfigMap key holding the newline-delimited image list
pub const IMAGES_KEY: &str = "images";
/// Event reason for a successful pull by a cache replica
pub const REASON_IMAGE_ADDED: &str = "ImageAdded";
/// Event reason for a failed pull by a cache replica
pub const REASON_IMAGE_ERROR: &str = "ImageError";
/// Event annotation naming the image the event is about
pub const IMAGE_ANNOTATION: &str = "cache.wasm-mesh.io/image";

/// Location of the cache registry ConfigMap and its DaemonSet
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheRef {
    /// Name shared by the ConfigMap and the DaemonSet
    pub name: String,
    /// Namespace of the cache
    pub namespace: String,
}

impl CacheRef {
    /// Reference the cache `name` in `namespace`
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for CacheRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}

/// Outcome reported by a cache replica
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventOutcome {
    /// The replica has the image on disk
    Success,
    /// The replica failed to fetch the image
    Error,
}

/// An acknowledgment from one cache replica
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEvent {
    /// Event name
    pub name: String,
    /// Event namespace
    pub namespace: String,
    /// Outcome reported
    pub outcome: EventOutcome,
    /// Node host of the reporting replica
    pub source_host: String,
    /// Image the event refers to
    pub image: String,
}

/// Storage behind the cache registry and its events
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch the registry ConfigMap; a missing cache is a NotFound error
    async fn get_registry(&self, cache: &CacheRef) -> Result<ConfigMap>;

    /// Persist an updated registry ConfigMap
    async fn update_registry(&self, config_map: &ConfigMap) -> Result<()>;

    /// All events in the cache namespace about `image`
    async fn list_image_events(&self, cache: &CacheRef, image: &str) -> Result<Vec<CacheEvent>>;

    /// Delete one event; an already deleted event is not an error
    async fn delete_event(&self, namespace: &str, name: &str) -> Result<()>;

    /// Number of ready cache replicas
    async fn ready_replicas(&self, cache: &CacheRef) -> Result<i32>;
}

/// Real Kubernetes [`CacheStore`] implementation
pub struct CacheStoreImpl {
    client: Client,
}

impl CacheStoreImpl {
    /// Create a store wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn cache_event(event: Event, image: &str) -> Option<CacheEvent> {
    let annotated = event
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(IMAGE_ANNOTATION))?;
    if annotated != image {
        return None;
    }
    let outcome = match event.reason.as_deref() {
        Some(REASON_IMAGE_ADDED) => EventOutcome::Success,
        _ => EventOutcome::Error,
    };
    Some(CacheEvent {
        name: event.metadata.name.unwrap_or_default(),
        namespace: event.metadata.namespace.unwrap_or_default(),
        outcome,
        source_host: event.source.and_then(|s| s.host).unwrap_or_default(),
        image: image.to_string(),
    })
}

#[async_trait]
impl CacheStore for CacheStoreImpl {
    async fn get_registry(&self, cache: &CacheRef) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &cache.namespace);
        ignore_not_found(api.get(&cache.name).await)?
            .ok_or_else(|| Error::not_found("ConfigMap", &cache.namespace, &cache.name))
    }

    async fn update_registry(&self, config_map: &ConfigMap) -> Result<()> {
        let namespace = config_map.metadata.namespace.as_deref().unwrap_or_default();
        let name = config_map.metadata.name.as_deref().unwrap_or_default();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), config_map).await?;
        Ok(())
    }

    async fn list_image_events(&self, cache: &CacheRef, image: &str) -> Result<Vec<CacheEvent>> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), &cache.namespace);
        let events = api.list(&ListParams::default()).await?;
        Ok(events
            .items
            .into_iter()
            .filter_map(|e| cache_event(e, image))
            .collect())
    }

    async fn delete_event(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)?;
        Ok(())
    }

    async fn ready_replicas(&self, cache: &CacheRef) -> Result<i32> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &cache.namespace);
        let daemonset = ignore_not_found(api.get(&cache.name).await)?
            .ok_or_else(|| Error::not_found("DaemonSet", &cache.namespace, &cache.name))?;
        Ok(daemonset.status.map(|s| s.number_ready).unwrap_or(0))
    }
}

/// Publishes images to the cache and waits for replicas to fetch them
#[derive(Clone)]
pub struct CacheSynchronizer {
    store: Arc<dyn CacheStore>,
    poll_interval: Duration,
}

impl CacheSynchronizer {
    /// Create a synchronizer polling `store` every `poll_interval`
    ///
    /// The interval must be non-zero.
    pub fn new(store: Arc<dyn CacheStore>, poll_interval: Duration) -> Result<Self> {
        if poll_interval.is_zero() {
            return Err(Error::validation_for_field(
                "cachePollInterval",
                "cache poll interval must be greater than zero",
            ));
        }
        Ok(Self {
            store,
            poll_interval,
        })
    }

    /// Add `image` to the registry list, returning whether it was added
    ///
    /// The registry is never created here: a cache that is not deployed is
    /// an error.
    pub async fn publish(&self, cache: &CacheRef, image: &str) -> Result<bool> {
        let mut config_map = self.store.get_registry(cache).await?;
        let data = config_map.data.get_or_insert_with(BTreeMap::new);
        let current = data.get(IMAGES_KEY).map(String::as_str).unwrap_or_default();

        if current.split('\n').any(|existing| existing == image) {
            info!(cache = %cache, image = %image, "image is already cached");
            return Ok(false);
        }

        let mut images: Vec<&str> = current.split('\n').filter(|i| !i.is_empty()).collect();
        images.push(image);
        let updated = images.join("\n");
        data.insert(IMAGES_KEY.to_string(), updated);
        self.store.update_registry(&config_map).await?;

        info!(cache = %cache, image = %image, "added image to cache config");
        Ok(true)
    }

    /// Wait until every ready replica has reported success for `image`
    ///
    /// A zero `timeout` returns immediately without reading any events. The
    /// ready count is re-read on every poll since replicas may still be
    /// starting.
    pub async fn await_acknowledgment(
        &self,
        cache: &CacheRef,
        image: &str,
        timeout: Duration,
    ) -> Result<()> {
        if timeout.is_zero() {
            info!(image = %image, "skipping cache events wait");
            return Ok(());
        }
        info!(image = %image, timeout = ?timeout, "waiting for cache events");

        let mut last_mismatch = String::from("no events observed");
        let poll = async {
            let mut interval = tokio::time::interval(self.poll_interval);
            loop {
                interval.tick().await;
                if self.acknowledged(cache, image, &mut last_mismatch).await? {
                    return Ok::<(), Error>(());
                }
            }
        };

        let outcome = tokio::time::timeout(timeout, poll).await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::SyncTimeout {
                image: image.to_string(),
                timeout,
                last_mismatch,
            }),
        }
    }

    async fn acknowledged(
        &self,
        cache: &CacheRef,
        image: &str,
        last_mismatch: &mut String,
    ) -> Result<bool> {
        let events = self.store.list_image_events(cache, image).await?;

        let mut hosts = BTreeSet::new();
        for event in &events {
            match event.outcome {
                EventOutcome::Error => {
                    warn!(event = %event.name, host = %event.source_host, image = %image, "cache replica reported an error");
                }
                EventOutcome::Success => {
                    hosts.insert(event.source_host.as_str());
                }
            }
        }

        let ready = self.store.ready_replicas(cache).await?;
        if usize::try_from(ready).ok() == Some(hosts.len()) {
            debug!(image = %image, replicas = ready, "all cache replicas acknowledged image");
            return Ok(true);
        }

        *last_mismatch = format!(
            "expected {} image-ready events for image {}, only found {:?}",
            ready, image, hosts
        );
        warn!(image = %image, mismatch = %last_mismatch, "cache not yet synchronized");
        Ok(false)
    }

    /// Delete every event about `image`, whatever its outcome
    pub async fn cleanup(&self, cache: &CacheRef, image: &str) -> Result<()> {
        info!(image = %image, "cleaning up cache events");
        let events = self.store.list_image_events(cache, image).await?;
        for event in events {
            self.store
                .delete_event(&event.namespace, &event.name)
                .await?;
        }
        Ok(())
    }
}
