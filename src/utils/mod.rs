pub mod backoff;
pub mod graceful_shutdown;
pub mod keyed_lock;

pub use backoff::Backoff;
pub use graceful_shutdown::GracefulShutdown;
pub use keyed_lock::KeyedLocks;
