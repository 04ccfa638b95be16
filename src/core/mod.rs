pub mod names;
pub mod operator;
pub mod resolver;

pub use operator::{Reconciler, ScaleHandler};
pub use resolver::{HostManager, Throttler};
