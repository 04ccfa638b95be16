pub mod elasti_server;
pub mod endpoint_readiness;
pub mod http_client;
pub mod internal_server;
pub mod kube_cluster;
pub mod memory_cluster;
pub mod operator_client;
pub mod prometheus_scaler;
pub mod resolver_handler;

/// Re-export commonly used types from adapters
pub use elasti_server::ElastiServer;
pub use endpoint_readiness::EndpointSliceReadiness;
pub use http_client::HttpClientAdapter;
pub use kube_cluster::KubeCluster;
pub use memory_cluster::MemoryCluster;
pub use operator_client::{OperatorClient, RequestCount};
pub use prometheus_scaler::TriggerScalerFactory;
pub use resolver_handler::ResolverHandler;
