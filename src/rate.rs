use std::collections::VecDeque;
use std::time::Instant;

/// Waveform rate over the last few events. Advisory only.
#[derive(Debug)]
pub struct PerformanceTracker {
    window: usize,
    times: VecDeque<Instant>,
    total: u64,
}

impl PerformanceTracker {
    pub fn new(window: usize) -> PerformanceTracker {
        let window = window.max(2);
        PerformanceTracker { window, times: VecDeque::with_capacity(window), total: 0 }
    }

    pub fn record(&mut self, at: Instant) {
        if self.times.len() == self.window {
            self.times.pop_front();
        }
        self.times.push_back(at);
        self.total += 1;
    }

    /// Events per second across the window, once at least two events have been seen.
    pub fn rate(&self) -> Option<f64> {
        let (first, last) = (self.times.front()?, self.times.back()?);
        let elapsed = last.duration_since(*first).as_secs_f64();
        if self.times.len() < 2 || elapsed <= 0.0 {
            return None
        }
        Some((self.times.len() - 1) as f64 / elapsed)
    }

    /// Events recorded since the tracker was created or last reset.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn reset(&mut self) {
        self.times.clear();
        self.total = 0;
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_rate_over_window() {
        let mut tracker = PerformanceTracker::new(3);
        let start = Instant::now();
        assert_eq!(tracker.rate(), None);
        tracker.record(start);
        assert_eq!(tracker.rate(), None);
        // first sample falls out of the window
        tracker.record(start + Duration::from_secs(10));
        tracker.record(start + Duration::from_millis(10_100));
        tracker.record(start + Duration::from_millis(10_200));
        let rate = tracker.rate().unwrap();
        assert!((rate - 10.0).abs() < 1e-6, "rate = {}", rate);
        assert_eq!(tracker.total(), 4);
    }
}
