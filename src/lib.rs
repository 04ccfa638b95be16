//! Elasti - scale-to-zero for Kubernetes services.
//!
//! Two long-running components share this crate:
//!
//! - the **resolver**, a reverse proxy that receives traffic for services whose
//!   workload has been scaled to zero. It holds each request until the workload
//!   reports ready endpoints, forwards it to the service's private twin and then
//!   steps out of the path for a short cooldown.
//! - the **operator**, which reconciles `ElastiService` resources. It watches the
//!   scale target, switches the public service between *proxy* mode (endpoints
//!   point at the resolver) and *serve* mode (endpoints point at the workload),
//!   and periodically evaluates triggers to scale workloads to and from zero.
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while
//! keeping the proxy and reconcile logic inside `core`. Cluster access goes through
//! [`ports::cluster::ClusterApi`], which has a Kubernetes adapter and an in-memory
//! adapter used by the tests.
//!
//! # Error Handling
//! Domain errors are `thiserror` enums; orchestration code returns `eyre::Result<T>`
//! with context attached through `WrapErr`.
//!
//! # Concurrency & Data Structures
//! Shared maps (host cache, CRD directory, informer registry, queue counters) are
//! `scc::HashMap`s. Admission counters are lock-free atomics.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{
        ElastiServer, EndpointSliceReadiness, HttpClientAdapter, KubeCluster, MemoryCluster,
        OperatorClient, ResolverHandler, TriggerScalerFactory,
    },
    core::{HostManager, Reconciler, ScaleHandler, Throttler},
    ports::{cluster::ClusterApi, http_client::HttpClient},
    utils::GracefulShutdown,
};
