use std::{
    future::Future,
    sync::atomic::{AtomicI64, Ordering},
};

use thiserror::Error;
use tokio::time::Instant;

use super::semaphore::Semaphore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BreakerError {
    /// Queue depth plus concurrency are all taken
    #[error("request queue is full! This request is dropped")]
    QueueFull,

    /// The request deadline passed while waiting for a concurrency slot
    #[error("deadline exceeded while waiting for a slot")]
    DeadlineExceeded,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerParams {
    pub queue_depth: u32,
    pub max_concurrency: u32,
    pub initial_capacity: u32,
}

/// Admission control in front of the throttler: at most
/// `queue_depth + max_concurrency` requests are admitted at once and at most
/// the semaphore's capacity of them run their work concurrently.
pub struct Breaker {
    in_flight: AtomicI64,
    total_slots: i64,
    sem: Semaphore,
}

struct SlotGuard<'a>(&'a AtomicI64);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct PermitGuard<'a>(&'a Semaphore);

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl Breaker {
    pub fn new(params: BreakerParams) -> Self {
        Self {
            in_flight: AtomicI64::new(0),
            total_slots: i64::from(params.queue_depth) + i64::from(params.max_concurrency),
            sem: Semaphore::new(params.max_concurrency, params.initial_capacity),
        }
    }

    /// Run `thunk` once a slot is free.
    ///
    /// Slots are returned on every exit path, including a panic inside the
    /// thunk or the returned future being dropped.
    pub async fn maybe<F, Fut, T>(&self, deadline: Instant, thunk: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.try_reserve() {
            return Err(BreakerError::QueueFull);
        }
        let _slot = SlotGuard(&self.in_flight);

        self.sem
            .acquire(deadline)
            .await
            .map_err(|_| BreakerError::DeadlineExceeded)?;
        let _permit = PermitGuard(&self.sem);

        Ok(thunk().await)
    }

    fn try_reserve(&self) -> bool {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.total_slots {
                return false;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn update_concurrency(&self, size: u32) {
        self.sem.update_capacity(size);
    }

    /// Requests admitted and not yet finished, queued or running.
    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u32 {
        self.sem.capacity()
    }
}
