use std::time::{Duration, Instant};

/// Smoothing weight of the newest interval
pub const RATE_ALPHA: f64 = 0.01;

/// Intervals shorter than this carry no usable rate
pub const MIN_INTERVAL: Duration = Duration::from_micros(1);

/// Exponentially smoothed frame rate from monotonic cycle timestamps
#[derive(Debug, Clone)]
pub struct RateEstimator {
    alpha: f64,
    rate: f64,
    last: Option<Instant>,
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new(RATE_ALPHA)
    }
}

impl RateEstimator {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            rate: 0.0,
            last: None,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Record the end of a cycle at `now` and return the updated estimate
    pub fn sample(&mut self, now: Instant) -> f64 {
        if let Some(last) = self.last {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < MIN_INTERVAL {
                // Keep the older stamp so the next interval spans both cycles.
                return self.rate;
            }
            self.update(elapsed);
        }
        self.last = Some(now);
        self.rate
    }

    /// Fold one inter-frame interval into the estimate
    pub fn update(&mut self, elapsed: Duration) {
        if elapsed < MIN_INTERVAL {
            return;
        }
        let inst = 1.0 / elapsed.as_secs_f64();
        self.rate = self.rate * (1.0 - self.alpha) + inst * self.alpha;
    }

    /// Forget the previous timestamp, e.g. after a timeout gap
    pub fn reset_interval(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_to_constant_rate() {
        let mut est = RateEstimator::default();
        for _ in 0..2000 {
            est.update(Duration::from_millis(4));
        }
        assert!((est.rate() - 250.0).abs() < 0.5, "rate {}", est.rate());
    }

    #[test]
    fn zero_interval_is_ignored() {
        let mut est = RateEstimator::default();
        est.update(Duration::from_millis(10));
        let before = est.rate();
        est.update(Duration::ZERO);
        assert_eq!(est.rate(), before);
    }

    #[test]
    fn sub_microsecond_interval_is_ignored() {
        let mut est = RateEstimator::default();
        for _ in 0..500 {
            est.update(Duration::from_millis(10));
        }
        let before = est.rate();
        est.update(Duration::from_nanos(1));
        est.update(Duration::from_nanos(999));
        assert_eq!(est.rate(), before);
        est.update(MIN_INTERVAL);
        assert!(est.rate() > before);
    }

    #[test]
    fn near_simultaneous_samples_keep_first_stamp() {
        let mut est = RateEstimator::new(1.0);
        let t0 = Instant::now();
        est.sample(t0);
        assert_eq!(est.sample(t0 + Duration::from_nanos(1)), 0.0);
        let rate = est.sample(t0 + Duration::from_millis(10));
        assert!((rate - 100.0).abs() < 1e-6, "rate {}", rate);
    }

    #[test]
    fn reset_skips_gap() {
        let mut est = RateEstimator::default();
        let t0 = Instant::now();
        est.sample(t0);
        est.sample(t0 + Duration::from_millis(10));
        let before = est.rate();
        est.reset_interval();
        est.sample(t0 + Duration::from_secs(5));
        assert_eq!(est.rate(), before);
    }
}
