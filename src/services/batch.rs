//! Per-consumer settlement and throughput accounting.
//!
//! Every `batch_size`-th settled delivery is rejected instead of acknowledged,
//! which keeps a steady trickle of deliveries flowing through the broker's
//! rejected list. The same boundary closes a throughput window.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputReport {
    /// Deliveries settled by the consumer so far.
    pub count: u64,
    pub elapsed: Duration,
    pub per_second: f64,
}

#[derive(Debug)]
pub struct BatchPolicy {
    batch_size: u64,
    count: u64,
    window_start: Instant,
}

impl BatchPolicy {
    /// `batch_size` of zero is treated as one.
    pub fn new(batch_size: u64) -> Self {
        Self {
            batch_size: batch_size.max(1),
            count: 0,
            window_start: Instant::now(),
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn record(&mut self) -> (Settlement, Option<ThroughputReport>) {
        self.record_at(Instant::now())
    }

    pub fn record_at(&mut self, now: Instant) -> (Settlement, Option<ThroughputReport>) {
        self.count += 1;
        if self.count % self.batch_size != 0 {
            return (Settlement::Ack, None);
        }

        let elapsed = now.saturating_duration_since(self.window_start);
        self.window_start = now;
        let secs = elapsed.as_secs_f64();
        let per_second = if secs > 0.0 {
            self.batch_size as f64 / secs
        } else {
            f64::INFINITY
        };

        (
            Settlement::Reject,
            Some(ThroughputReport {
                count: self.count,
                elapsed,
                per_second,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_reject_per_batch() {
        let mut policy = BatchPolicy::new(4);
        let settlements: Vec<Settlement> = (0..12).map(|_| policy.record().0).collect();

        for chunk in settlements.chunks(4) {
            assert_eq!(
                chunk,
                &[
                    Settlement::Ack,
                    Settlement::Ack,
                    Settlement::Ack,
                    Settlement::Reject
                ]
            );
        }
        assert_eq!(policy.count(), 12);
    }

    #[test]
    fn test_report_covers_window_since_last_boundary() {
        let start = Instant::now();
        let mut policy = BatchPolicy {
            batch_size: 10,
            count: 0,
            window_start: start,
        };

        for i in 1..10 {
            assert_eq!(
                policy.record_at(start + Duration::from_millis(i * 100)),
                (Settlement::Ack, None)
            );
        }
        let (settlement, report) = policy.record_at(start + Duration::from_secs(2));
        assert_eq!(settlement, Settlement::Reject);
        let report = report.unwrap();
        assert_eq!(report.count, 10);
        assert_eq!(report.elapsed, Duration::from_secs(2));
        assert!((report.per_second - 5.0).abs() < f64::EPSILON);

        // The next window starts at the previous boundary.
        for _ in 1..10 {
            policy.record_at(start + Duration::from_secs(3));
        }
        let (_, report) = policy.record_at(start + Duration::from_secs(3));
        let report = report.unwrap();
        assert_eq!(report.count, 20);
        assert_eq!(report.elapsed, Duration::from_secs(1));
    }

    #[test]
    fn test_zero_batch_size_rejects_every_delivery() {
        let mut policy = BatchPolicy::new(0);
        assert_eq!(policy.record().0, Settlement::Reject);
        assert_eq!(policy.record().0, Settlement::Reject);
    }
}
