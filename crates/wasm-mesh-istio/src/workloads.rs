//! Workload enumeration
//!
//! Lists Deployments, DaemonSets or StatefulSets matching a label selector,
//! hands each pod template to a mutation callback and persists the result.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;
use wasm_mesh_common::kube_utils::label_selector;
use wasm_mesh_common::{Error, Result};

#[cfg(test)]
use mockall::automock;

/// Supported workload kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 DaemonSet
    DaemonSet,
    /// apps/v1 StatefulSet
    StatefulSet,
}

impl WorkloadKind {
    /// All supported kinds, in the order they are reported in errors
    pub const ALL: [WorkloadKind; 3] = [
        WorkloadKind::Deployment,
        WorkloadKind::DaemonSet,
        WorkloadKind::StatefulSet,
    ];

    /// Lower-case token accepted by [`FromStr`]
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::DaemonSet => "daemonset",
            WorkloadKind::StatefulSet => "statefulset",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_lowercase();
        WorkloadKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lower)
            .ok_or_else(|| {
                let supported: Vec<&str> = WorkloadKind::ALL.iter().map(|k| k.as_str()).collect();
                Error::validation_for_field(
                    "kind",
                    format!(
                        "unknown workload type {}, must be one of: {}",
                        s,
                        supported.join(", ")
                    ),
                )
            })
    }
}

impl Serialize for WorkloadKind {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for WorkloadKind {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A workload fetched from the store
#[derive(Clone, Debug, PartialEq)]
pub enum Workload {
    /// A Deployment
    Deployment(Deployment),
    /// A DaemonSet
    DaemonSet(DaemonSet),
    /// A StatefulSet
    StatefulSet(StatefulSet),
}

impl Workload {
    /// Kind of this workload
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::Deployment(_) => WorkloadKind::Deployment,
            Workload::DaemonSet(_) => WorkloadKind::DaemonSet,
            Workload::StatefulSet(_) => WorkloadKind::StatefulSet,
        }
    }

    /// Object metadata
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Workload::Deployment(w) => &w.metadata,
            Workload::DaemonSet(w) => &w.metadata,
            Workload::StatefulSet(w) => &w.metadata,
        }
    }

    /// Object name, empty if unset
    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// The pod template, if the workload has a spec
    pub fn pod_template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Workload::Deployment(w) => w.spec.as_ref().map(|s| &s.template),
            Workload::DaemonSet(w) => w.spec.as_ref().map(|s| &s.template),
            Workload::StatefulSet(w) => w.spec.as_ref().map(|s| &s.template),
        }
    }

    /// Mutable pod template, creating an empty spec if none exists
    pub fn pod_template_mut(&mut self) -> &mut PodTemplateSpec {
        match self {
            Workload::Deployment(w) => &mut w.spec.get_or_insert_with(Default::default).template,
            Workload::DaemonSet(w) => &mut w.spec.get_or_insert_with(Default::default).template,
            Workload::StatefulSet(w) => &mut w.spec.get_or_insert_with(Default::default).template,
        }
    }
}

/// Store holding the workloads we mutate
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    /// List workloads of `kind` in `namespace` matching `label_selector`
    async fn list(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Workload>>;

    /// Persist a (possibly mutated) workload
    async fn update(&self, workload: &Workload) -> Result<()>;
}

/// Real Kubernetes [`WorkloadStore`] implementation
pub struct WorkloadStoreImpl {
    client: Client,
}

impl WorkloadStoreImpl {
    /// Create a store wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadStore for WorkloadStoreImpl {
    async fn list(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Workload>> {
        let params = ListParams::default().labels(label_selector);
        let workloads = match kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                api.list(&params)
                    .await?
                    .items
                    .into_iter()
                    .map(Workload::Deployment)
                    .collect()
            }
            WorkloadKind::DaemonSet => {
                let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
                api.list(&params)
                    .await?
                    .items
                    .into_iter()
                    .map(Workload::DaemonSet)
                    .collect()
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                api.list(&params)
                    .await?
                    .items
                    .into_iter()
                    .map(Workload::StatefulSet)
                    .collect()
            }
        };
        Ok(workloads)
    }

    async fn update(&self, workload: &Workload) -> Result<()> {
        let namespace = workload.metadata().namespace.as_deref().unwrap_or_default();
        let name = workload.name();
        let params = PostParams::default();
        match workload {
            Workload::Deployment(w) => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                api.replace(name, &params, w).await?;
            }
            Workload::DaemonSet(w) => {
                let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
                api.replace(name, &params, w).await?;
            }
            Workload::StatefulSet(w) => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                api.replace(name, &params, w).await?;
            }
        }
        Ok(())
    }
}

/// Enumerates target workloads and applies a mutation to each
#[derive(Clone)]
pub struct WorkloadSelector {
    store: Arc<dyn WorkloadStore>,
}

impl WorkloadSelector {
    /// Create a selector over the given store
    pub fn new(store: Arc<dyn WorkloadStore>) -> Self {
        Self { store }
    }

    /// Run `mutate` over every matching workload's pod template, persisting
    /// each workload after its mutation succeeds.
    ///
    /// `mutate` receives the workload metadata and an owned copy of the pod
    /// template and returns the template to persist. Processing is
    /// sequential in listing order and stops at the first error from either
    /// the callback or the store, which is returned unchanged. Returns the
    /// metadata of every persisted workload.
    pub async fn list_and_mutate<F, Fut>(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        labels: &BTreeMap<String, String>,
        mutate: F,
    ) -> Result<Vec<ObjectMeta>>
    where
        F: FnMut(ObjectMeta, PodTemplateSpec) -> Fut,
        Fut: Future<Output = Result<PodTemplateSpec>>,
    {
        self.list_and_mutate_with(kind, namespace, labels, mutate, |_, _| {})
            .await
    }

    /// Like [`list_and_mutate`](Self::list_and_mutate), additionally calling
    /// `on_result` once per workload with the combined outcome of its
    /// mutation and persistence.
    ///
    /// `on_result` runs before the error is propagated, so the workload that
    /// aborts the enumeration is still reported.
    pub async fn list_and_mutate_with<F, Fut, R>(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        labels: &BTreeMap<String, String>,
        mut mutate: F,
        mut on_result: R,
    ) -> Result<Vec<ObjectMeta>>
    where
        F: FnMut(ObjectMeta, PodTemplateSpec) -> Fut,
        Fut: Future<Output = Result<PodTemplateSpec>>,
        R: FnMut(&ObjectMeta, Option<&Error>),
    {
        let selector = label_selector(labels);
        let workloads = self.store.list(kind, namespace, &selector).await?;
        debug!(
            kind = %kind,
            namespace = %namespace,
            selector = %selector,
            count = workloads.len(),
            "listed workloads"
        );

        let mut persisted = Vec::with_capacity(workloads.len());
        for mut workload in workloads {
            let meta = workload.metadata().clone();
            let template = std::mem::take(workload.pod_template_mut());
            let result = match mutate(meta.clone(), template).await {
                Ok(template) => {
                    *workload.pod_template_mut() = template;
                    self.store.update(&workload).await
                }
                Err(e) => Err(e),
            };
            on_result(&meta, result.as_ref().err());
            result?;
            persisted.push(meta);
        }
        Ok(persisted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta as K8sMeta;
    use mockall::predicate::eq;
    use std::sync::Mutex;

    fn deployment(name: &str, app: &str) -> Workload {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), app.to_string());
        Workload::Deployment(Deployment {
            metadata: K8sMeta {
                name: Some(name.to_string()),
                namespace: Some("bookinfo".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    metadata: Some(K8sMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: None,
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn annotate(mut template: PodTemplateSpec) -> PodTemplateSpec {
        template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert("touched".to_string(), "yes".to_string());
        template
    }

    #[test]
    fn kind_parsing_is_case_insensitive() {
        assert_eq!("Deployment".parse::<WorkloadKind>().unwrap(), WorkloadKind::Deployment);
        assert_eq!("DAEMONSET".parse::<WorkloadKind>().unwrap(), WorkloadKind::DaemonSet);
        assert_eq!("statefulSet".parse::<WorkloadKind>().unwrap(), WorkloadKind::StatefulSet);
    }

    #[test]
    fn unsupported_kind_lists_every_supported_kind() {
        let err = "cronjob".parse::<WorkloadKind>().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cronjob"));
        assert!(msg.contains("deployment, daemonset, statefulset"));
        assert_eq!(err.category(), wasm_mesh_common::ErrorCategory::Validation);
    }

    #[test]
    fn kind_round_trips_through_serde() {
        let json = serde_json::to_value(WorkloadKind::DaemonSet).unwrap();
        assert_eq!(json, serde_json::json!("daemonset"));
        let kind: WorkloadKind = serde_json::from_value(serde_json::json!("DaemonSet")).unwrap();
        assert_eq!(kind, WorkloadKind::DaemonSet);
        assert!(serde_json::from_value::<WorkloadKind>(serde_json::json!("job")).is_err());
    }

    #[test]
    fn pod_template_mut_creates_missing_spec() {
        let mut ds = Workload::DaemonSet(DaemonSet::default());
        assert!(ds.pod_template().is_none());
        ds.pod_template_mut();
        assert!(ds.pod_template().is_some());
        assert_eq!(ds.kind(), WorkloadKind::DaemonSet);
    }

    #[tokio::test]
    async fn mutates_and_persists_each_workload_in_order() {
        let mut store = MockWorkloadStore::new();
        store
            .expect_list()
            .with(eq(WorkloadKind::Deployment), eq("bookinfo"), eq("app=reviews"))
            .times(1)
            .returning(|_, _, _| Ok(vec![deployment("reviews-v1", "reviews"), deployment("reviews-v2", "reviews")]));

        let updated = Arc::new(Mutex::new(Vec::new()));
        let sink = updated.clone();
        store.expect_update().times(2).returning(move |w| {
            let touched = w
                .pod_template()
                .and_then(|t| t.metadata.as_ref())
                .and_then(|m| m.annotations.as_ref())
                .map(|a| a.contains_key("touched"))
                .unwrap_or(false);
            sink.lock().unwrap().push((w.name().to_string(), touched));
            Ok(())
        });

        let selector = WorkloadSelector::new(Arc::new(store));
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "reviews".to_string());

        let persisted = selector
            .list_and_mutate(WorkloadKind::Deployment, "bookinfo", &labels, |_, t| async move {
                Ok(annotate(t))
            })
            .await
            .expect("enumeration succeeds");

        assert_eq!(persisted.len(), 2);
        assert_eq!(
            *updated.lock().unwrap(),
            vec![
                ("reviews-v1".to_string(), true),
                ("reviews-v2".to_string(), true)
            ]
        );
    }

    #[tokio::test]
    async fn callback_error_aborts_before_persisting() {
        let mut store = MockWorkloadStore::new();
        store
            .expect_list()
            .returning(|_, _, _| Ok(vec![deployment("a", "x"), deployment("b", "x")]));
        store.expect_update().times(0);

        let selector = WorkloadSelector::new(Arc::new(store));
        let mut calls = 0;
        let err = selector
            .list_and_mutate(WorkloadKind::Deployment, "bookinfo", &BTreeMap::new(), |_, _| {
                calls += 1;
                async { Err(Error::validation("bad annotation")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls, 1);
        assert_eq!(err.to_string(), "validation error: bad annotation");
    }

    #[tokio::test]
    async fn persistence_error_aborts_enumeration() {
        let mut store = MockWorkloadStore::new();
        store
            .expect_list()
            .returning(|_, _, _| Ok(vec![deployment("a", "x"), deployment("b", "x")]));
        store
            .expect_update()
            .times(1)
            .returning(|_| Err(Error::upstream("workload-store", "conflict")));

        let selector = WorkloadSelector::new(Arc::new(store));
        let err = selector
            .list_and_mutate(WorkloadKind::Deployment, "bookinfo", &BTreeMap::new(), |_, t| async move {
                Ok(t)
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("conflict"));
    }

    #[tokio::test]
    async fn on_result_reports_persistence_failure() {
        let mut store = MockWorkloadStore::new();
        store
            .expect_list()
            .returning(|_, _, _| Ok(vec![deployment("a", "x"), deployment("b", "x"), deployment("c", "x")]));
        let mut updates = 0;
        store.expect_update().times(2).returning(move |_| {
            updates += 1;
            if updates == 2 {
                Err(Error::upstream("workload-store", "conflict"))
            } else {
                Ok(())
            }
        });

        let selector = WorkloadSelector::new(Arc::new(store));
        let mut reported = Vec::new();
        let err = selector
            .list_and_mutate_with(
                WorkloadKind::Deployment,
                "bookinfo",
                &BTreeMap::new(),
                |_, t| async move { Ok(t) },
                |meta, err| reported.push((meta.name.clone().unwrap_or_default(), err.map(|e| e.to_string()))),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("conflict"));
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0], ("a".to_string(), None));
        assert_eq!(reported[1].0, "b");
        assert!(reported[1].1.as_deref().unwrap_or_default().contains("conflict"));
    }

    #[tokio::test]
    async fn listing_errors_propagate_for_every_kind() {
        for kind in WorkloadKind::ALL {
            let mut store = MockWorkloadStore::new();
            store
                .expect_list()
                .returning(|_, _, _| Err(Error::upstream("workload-store", "forbidden")));
            let selector = WorkloadSelector::new(Arc::new(store));
            let result = selector
                .list_and_mutate(kind, "bookinfo", &BTreeMap::new(), |_, t| async move { Ok(t) })
                .await;
            assert!(result.is_err(), "listing error swallowed for {kind}");
        }
    }

    #[tokio::test]
    async fn empty_selector_lists_everything() {
        let mut store = MockWorkloadStore::new();
        store
            .expect_list()
            .with(eq(WorkloadKind::StatefulSet), eq("db"), eq(""))
            .returning(|_, _, _| Ok(vec![]));
        let selector = WorkloadSelector::new(Arc::new(store));
        let persisted = selector
            .list_and_mutate(WorkloadKind::StatefulSet, "db", &BTreeMap::new(), |_, t| async move {
                Ok(t)
            })
            .await
            .unwrap();
        assert!(persisted.is_empty());
    }
}
