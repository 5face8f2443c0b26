//! Deploy WASM HTTP filters to Istio sidecars
//!
//! The entry point is [`IstioProvider`], which applies or removes a
//! [`FilterSpec`] on the workloads selected by a [`ProviderConfig`]. Every
//! system it talks to sits behind a trait so the Kubernetes-backed
//! implementations can be swapped out.

#![deny(missing_docs)]

pub mod abi;
pub mod annotations;
pub mod cache;
pub mod config;
pub mod ensurer;
pub mod filter;
pub mod patch;
pub mod provider;
pub mod version;
pub mod workloads;

pub use abi::{AbiRegistry, DefaultAbiRegistry};
pub use annotations::AnnotationMerger;
pub use cache::{CacheEvent, CacheRef, CacheStore, CacheSynchronizer, EventOutcome};
pub use config::{ProviderConfig, WorkloadTarget};
pub use ensurer::ResourceEnsurer;
pub use filter::{FilterSpec, ImageConfig, ImagePuller, PulledImage};
pub use patch::ConfigPatchBuilder;
pub use provider::{Collaborators, IstioProvider, WorkloadCallback};
pub use version::{select_schema, SchemaGeneration, VersionGate, VersionLookup};
pub use workloads::{Workload, WorkloadKind, WorkloadSelector, WorkloadStore};
