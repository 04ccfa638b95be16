//! Exponential backoff schedule with multiplicative jitter.
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    /// Fraction of each delay added at random, e.g. 0.1 adds up to 10%.
    pub jitter: f64,
    /// Maximum number of attempts the schedule allows.
    pub steps: u32,
    pub cap: Duration,
}

impl Backoff {
    /// Dial schedule for the resolver transport.
    pub const fn dial() -> Self {
        Self {
            initial: Duration::from_millis(50),
            factor: 1.4,
            jitter: 0.1,
            steps: 15,
            cap: Duration::from_secs(30),
        }
    }

    /// Restart schedule for supervised background tasks.
    pub const fn restart() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.1,
            steps: u32::MAX,
            cap: Duration::from_secs(60),
        }
    }

    /// Delay before the retry following `attempt` failures (attempt >= 1),
    /// without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial.as_secs_f64() * self.factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.cap.as_secs_f64()))
    }

    /// Delay with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter);
        base.mul_f64(1.0 + extra).min(self.cap)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_schedule_grows_by_factor() {
        let b = Backoff::dial();
        assert_eq!(b.base_delay(1).as_millis(), 50);
        let second = b.base_delay(2).as_secs_f64();
        assert!((second - 0.070).abs() < 1e-6);
        assert!(b.base_delay(3) > b.base_delay(2));
        assert!(!b.exhausted(14));
        assert!(b.exhausted(15));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let b = Backoff::dial();
        for attempt in 1..10 {
            let d = b.delay(attempt);
            let base = b.base_delay(attempt);
            assert!(d >= base);
            assert!(d <= base.mul_f64(1.1 + f64::EPSILON));
        }
    }

    #[test]
    fn test_restart_schedule_is_capped() {
        let b = Backoff::restart();
        assert_eq!(b.base_delay(20), Duration::from_secs(60));
    }
}
