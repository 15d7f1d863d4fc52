use crate::common::*;

/// Measures the number of events per second over an interval.
#[derive(Debug)]
pub struct RateCounter {
    count: f64,
    instant: Instant,
    interval: Duration,
}

impl RateCounter {
    pub fn new(interval: Duration) -> Self {
        Self {
            count: 0.0,
            instant: Instant::now(),
            interval,
        }
    }

    pub fn with_second_interval() -> Self {
        Self::new(Duration::from_secs(1))
    }

    pub fn add(&mut self, addition: f64) {
        self.count += addition;
    }

    pub fn rate(&mut self) -> Option<f64> {
        let elapsed = self.instant.elapsed();
        if elapsed >= self.interval {
            let rate = self.count / elapsed.as_secs_f64();
            self.count = 0.0;
            self.instant = Instant::now();
            Some(rate)
        } else {
            None
        }
    }
}

/// Format the remaining time of `remaining_steps` steps at `secs_per_step` as `H:MM:SS`.
pub fn format_eta(secs_per_step: f64, remaining_steps: usize) -> String {
    let total = (secs_per_step * remaining_steps as f64).max(0.0).round() as u64;
    format!("{}:{:02}:{:02}", total / 3600, total / 60 % 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eta_format() {
        assert_eq!(format_eta(0.5, 0), "0:00:00");
        assert_eq!(format_eta(1.5, 100), "0:02:30");
        assert_eq!(format_eta(2.0, 5000), "2:46:40");
    }

    #[test]
    fn rate_waits_for_interval() {
        let mut counter = RateCounter::new(Duration::from_secs(3600));
        counter.add(5.0);
        assert!(counter.rate().is_none());

        let mut counter = RateCounter::new(Duration::ZERO);
        counter.add(5.0);
        assert!(counter.rate().is_some());
    }
}
