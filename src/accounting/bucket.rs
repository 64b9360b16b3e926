use std::collections::BTreeMap;

use serde::Serialize;

/// Cumulative statistics for one `(origin, request class)` pair.
///
/// Invariant: `count == codes.values().sum() == classes.values().sum()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountingBucket {
    count: u64,
    sum: u64,
    #[serde(skip)]
    last_count: u64,
    #[serde(skip)]
    last_sum: u64,
    codes: BTreeMap<u16, u64>,
    classes: BTreeMap<u64, u64>,
}

impl AccountingBucket {
    /// Creates an empty bucket with every latency class pre-seeded at zero so
    /// exports always carry the same column set.
    pub fn new(thresholds: &[u64]) -> Self {
        Self {
            count: 0,
            sum: 0,
            last_count: 0,
            last_sum: 0,
            codes: BTreeMap::new(),
            classes: thresholds.iter().map(|&t| (t, 0)).collect(),
        }
    }

    /// Accounts one request.
    pub fn record(&mut self, elapsed_micros: u64, status_code: u16, latency_class: u64) {
        self.count += 1;
        self.sum = self.sum.saturating_add(elapsed_micros);
        *self.codes.entry(status_code).or_insert(0) += 1;
        *self.classes.entry(latency_class).or_insert(0) += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    pub fn last_count(&self) -> u64 {
        self.last_count
    }

    pub fn last_sum(&self) -> u64 {
        self.last_sum
    }

    pub fn codes(&self) -> &BTreeMap<u16, u64> {
        &self.codes
    }

    pub fn classes(&self) -> &BTreeMap<u64, u64> {
        &self.classes
    }

    /// Mean response time over the bucket's lifetime.
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum as f64 / self.count as f64
    }

    /// Mean response time of the requests accounted since the previous call,
    /// then marks the current totals as exported.
    ///
    /// Returns `None` when nothing was accounted in between.
    pub fn take_delta_rate(&mut self) -> Option<f64> {
        let requests = self.count - self.last_count;
        let elapsed = self.sum - self.last_sum;
        self.last_count = self.count;
        self.last_sum = self.sum;

        if requests == 0 {
            return None;
        }
        Some(elapsed as f64 / requests as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_bucket_preseeds_classes() {
        let bucket = AccountingBucket::new(&[0, 500_000, 5_000_000]);
        assert_eq!(bucket.count(), 0);
        assert_eq!(bucket.classes().len(), 3);
        assert!(bucket.classes().values().all(|&v| v == 0));
        assert!(bucket.codes().is_empty());
    }

    #[test]
    fn test_record_keeps_counts_consistent() {
        let mut bucket = AccountingBucket::new(&[0, 500_000]);
        bucket.record(100, 200, 0);
        bucket.record(600_000, 304, 500_000);
        bucket.record(200, 200, 0);

        assert_eq!(bucket.count(), 3);
        assert_eq!(bucket.sum(), 600_300);
        assert_eq!(bucket.codes().get(&200), Some(&2));
        assert_eq!(bucket.codes().get(&304), Some(&1));
        assert_eq!(bucket.codes().values().sum::<u64>(), bucket.count());
        assert_eq!(bucket.classes().values().sum::<u64>(), bucket.count());
    }

    #[test]
    fn test_delta_rate_consumes_window() {
        let mut bucket = AccountingBucket::new(&[0]);
        bucket.record(100, 200, 0);
        bucket.record(300, 200, 0);

        assert_eq!(bucket.take_delta_rate(), Some(200.0));
        assert_eq!(bucket.last_count(), 2);
        assert_eq!(bucket.last_sum(), 400);

        // Nothing new since the last export.
        assert_eq!(bucket.take_delta_rate(), None);

        bucket.record(1_000, 200, 0);
        assert_eq!(bucket.take_delta_rate(), Some(1_000.0));
        assert_eq!(bucket.count(), 3);
    }

    #[test]
    fn test_average_of_empty_bucket() {
        assert_eq!(AccountingBucket::new(&[]).average(), 0.0);
    }
}
