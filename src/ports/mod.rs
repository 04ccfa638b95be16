pub mod cluster;
pub mod http_client;
pub mod notifier;
pub mod readiness;
pub mod scaler;
