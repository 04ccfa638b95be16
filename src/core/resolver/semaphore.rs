use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::{Instant, timeout_at};

const CAPACITY_SHIFT: u32 = 32;
const LOW_MASK: u64 = 0xFFFF_FFFF;

fn pack(capacity: u32, in_flight: u32) -> u64 {
    (u64::from(capacity) << CAPACITY_SHIFT) | u64::from(in_flight)
}

fn unpack(state: u64) -> (u32, u32) {
    ((state >> CAPACITY_SHIFT) as u32, (state & LOW_MASK) as u32)
}

/// The deadline passed before a slot became free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineExceeded;

/// Counting semaphore whose capacity can change while requests are in flight.
///
/// Capacity and in-flight count live in one atomic word so that a single
/// compare-and-swap decides every transition. Waiters park on a token queue
/// bounded by `max_capacity`; tokens are hints, every woken waiter re-checks
/// the packed state before taking a slot.
pub struct Semaphore {
    state: AtomicU64,
    queue: tokio::sync::Semaphore,
    max_capacity: u32,
}

impl Semaphore {
    pub fn new(max_capacity: u32, initial_capacity: u32) -> Self {
        let capacity = initial_capacity.min(max_capacity);
        Self {
            state: AtomicU64::new(pack(capacity, 0)),
            queue: tokio::sync::Semaphore::new(0),
            max_capacity,
        }
    }

    /// Take a slot, waiting until one frees up or `deadline` passes.
    pub async fn acquire(&self, deadline: Instant) -> Result<(), DeadlineExceeded> {
        loop {
            let old = self.state.load(Ordering::Acquire);
            let (capacity, in_flight) = unpack(old);

            if in_flight >= capacity {
                match timeout_at(deadline, self.queue.acquire()).await {
                    Ok(Ok(token)) => {
                        token.forget();
                        continue;
                    }
                    // the queue is never closed
                    Ok(Err(_)) | Err(_) => return Err(DeadlineExceeded),
                }
            }

            if self
                .state
                .compare_exchange_weak(
                    old,
                    pack(capacity, in_flight + 1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Return a slot taken by [`Semaphore::acquire`].
    ///
    /// # Panics
    ///
    /// Panics when called more often than `acquire` succeeded.
    pub fn release(&self) {
        loop {
            let old = self.state.load(Ordering::Acquire);
            let (capacity, in_flight) = unpack(old);
            assert!(in_flight > 0, "release and acquire are not paired");

            let in_flight = in_flight - 1;
            if self
                .state
                .compare_exchange_weak(
                    old,
                    pack(capacity, in_flight),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                if in_flight < capacity {
                    self.wake_one();
                }
                return;
            }
        }
    }

    /// Change capacity; waiters are woken for every slot added.
    pub fn update_capacity(&self, size: u32) {
        let size = size.min(self.max_capacity);
        loop {
            let old = self.state.load(Ordering::Acquire);
            let (capacity, in_flight) = unpack(old);
            if capacity == size {
                return;
            }
            if self
                .state
                .compare_exchange_weak(
                    old,
                    pack(size, in_flight),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                for _ in capacity..size {
                    self.wake_one();
                }
                return;
            }
        }
    }

    pub fn capacity(&self) -> u32 {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    pub fn in_flight(&self) -> u32 {
        unpack(self.state.load(Ordering::Acquire)).1
    }

    fn wake_one(&self) {
        // Pending tokens never exceed max capacity; a dropped wake is harmless
        // because someone releasing later will post another.
        if self.queue.available_permits() < self.max_capacity as usize {
            self.queue.add_permits(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn test_pack_roundtrip_keeps_halves_apart() {
        let state = pack(7, u32::MAX);
        assert_eq!(unpack(state), (7, u32::MAX));
    }

    #[tokio::test]
    async fn test_acquire_up_to_capacity() {
        let sem = Semaphore::new(10, 2);
        sem.acquire(far()).await.unwrap();
        sem.acquire(far()).await.unwrap();
        assert_eq!(sem.in_flight(), 2);

        let short = Instant::now() + Duration::from_millis(20);
        assert_eq!(sem.acquire(short).await, Err(DeadlineExceeded));
        assert_eq!(sem.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        let sem = Arc::new(Semaphore::new(10, 1));
        sem.acquire(far()).await.unwrap();

        let waiter = {
            let sem = sem.clone();
            tokio::spawn(async move { sem.acquire(far()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        sem.release();

        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(sem.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_update_capacity_wakes_waiters() {
        let sem = Arc::new(Semaphore::new(10, 0));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let sem = sem.clone();
                tokio::spawn(async move { sem.acquire(far()).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sem.in_flight(), 0);

        sem.update_capacity(3);
        for waiter in waiters {
            assert!(waiter.await.unwrap().is_ok());
        }
        assert_eq!(sem.in_flight(), 3);
        assert_eq!(sem.capacity(), 3);
    }

    #[tokio::test]
    async fn test_capacity_clamped_to_max() {
        let sem = Semaphore::new(4, 100);
        assert_eq!(sem.capacity(), 4);
        sem.update_capacity(50);
        assert_eq!(sem.capacity(), 4);
    }

    #[test]
    #[should_panic(expected = "release and acquire are not paired")]
    fn test_unpaired_release_panics() {
        let sem = Semaphore::new(1, 1);
        sem.release();
    }
}
