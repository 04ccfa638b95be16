//! Operator core: the ElastiService controller and the scale handler.
pub mod crd;
pub mod directory;
pub mod handlers;
pub mod informer;
pub mod leader;
pub mod reconciler;
pub mod routing;
pub mod scale_handler;
pub mod workload;

pub use crd::{ElastiService, Mode, ScaleTargetKind};
pub use directory::{CrdDetails, CrdDirectory};
pub use informer::{InformerManager, WatchHandler, WatchRequest};
pub use leader::LeaderElector;
pub use reconciler::Reconciler;
pub use scale_handler::ScaleHandler;
