//! Rolling window of reconstruction outcomes

use std::collections::VecDeque;
use std::time::Duration;

use crate::clock::MonoTime;

/// Success/failure samples inside a sliding time window
#[derive(Debug)]
pub struct FailureWindow {
    window: Duration,
    threshold: f64,
    min_samples: usize,
    samples: VecDeque<(MonoTime, bool)>,
}

impl FailureWindow {
    pub fn new(window: Duration, threshold: f64, min_samples: usize) -> Self {
        FailureWindow {
            window,
            threshold,
            min_samples: min_samples.max(1),
            samples: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: MonoTime) {
        while let Some((at, _)) = self.samples.front() {
            if now.saturating_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record one outcome
    pub fn record(&mut self, now: MonoTime, success: bool) {
        self.samples.push_back((now, success));
        self.evict(now);
    }

    /// Failure fraction among samples in the window
    pub fn failure_rate(&mut self, now: MonoTime) -> f64 {
        self.evict(now);
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.samples.len() as f64
    }

    /// Whether enough samples are present and the failure rate reaches the threshold
    pub fn is_anomalous(&mut self, now: MonoTime) -> bool {
        let rate = self.failure_rate(now);
        self.samples.len() >= self.min_samples && rate >= self.threshold
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> FailureWindow {
        FailureWindow::new(Duration::from_millis(100), 0.5, 4)
    }

    #[test]
    fn test_needs_min_samples() {
        let mut w = window();
        let now = MonoTime::from_millis(1);
        for _ in 0..3 {
            w.record(now, false);
        }
        assert_eq!(w.failure_rate(now), 1.0);
        assert!(!w.is_anomalous(now));
        w.record(now, false);
        assert!(w.is_anomalous(now));
    }

    #[test]
    fn test_rate_below_threshold() {
        let mut w = window();
        let now = MonoTime::from_millis(1);
        w.record(now, false);
        for _ in 0..3 {
            w.record(now, true);
        }
        assert!((w.failure_rate(now) - 0.25).abs() < 1e-9);
        assert!(!w.is_anomalous(now));
    }

    #[test]
    fn test_old_samples_evicted() {
        let mut w = window();
        for _ in 0..4 {
            w.record(MonoTime::from_millis(0), false);
        }
        assert!(w.is_anomalous(MonoTime::from_millis(50)));
        assert!(!w.is_anomalous(MonoTime::from_millis(150)));
        assert!(w.is_empty());
    }
}
