use crate::common::*;

/// Counts items and reports the rate since the previous report.
#[derive(Debug)]
pub struct RateCounter {
    count: f64,
    instant: Instant,
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateCounter {
    pub fn new() -> Self {
        Self {
            count: 0.0,
            instant: Instant::now(),
        }
    }

    pub fn add(&mut self, addition: f64) {
        self.count += addition;
    }

    /// Items per second since the last call, then restarts counting.
    pub fn take_rate(&mut self) -> f64 {
        let elapsed = self.instant.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            self.count / elapsed
        } else {
            0.0
        };
        self.count = 0.0;
        self.instant = Instant::now();
        rate
    }
}
