//! Resolver core: admission control and per-host routing state.
pub mod breaker;
pub mod host_manager;
pub mod semaphore;
pub mod throttler;

pub use breaker::{Breaker, BreakerError, BreakerParams};
pub use host_manager::{Host, HostError, HostManager};
pub use semaphore::Semaphore;
pub use throttler::{ThrottleError, Throttler, ThrottlerParams};
