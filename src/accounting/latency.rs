use tracing::warn;

/// Ordered list of response-time thresholds in microseconds.
///
/// Classification scans the thresholds in their configured order and returns
/// the first one the response time reaches. The list is deliberately not
/// sorted: a list that is not ascending gives earlier entries precedence over
/// later, larger ones, and reordering it changes which class an event lands
/// in.
///
/// Threshold `0` is the fallback class. It is never matched during the scan,
/// otherwise a leading zero entry would swallow every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyClassTable {
    thresholds: Vec<u64>,
}

impl LatencyClassTable {
    pub fn new(thresholds: Vec<u64>) -> Self {
        Self { thresholds }
    }

    /// Thresholds in configured order.
    pub fn thresholds(&self) -> &[u64] {
        &self.thresholds
    }

    /// Return the latency class for a response time.
    pub fn classify(&self, elapsed_micros: u64) -> u64 {
        for &threshold in &self.thresholds {
            if threshold != 0 && elapsed_micros >= threshold {
                return threshold;
            }
        }
        if !self.thresholds.contains(&0) {
            warn!(elapsed_micros, "no latency class found, using class 0");
        }
        0
    }
}

impl Default for LatencyClassTable {
    fn default() -> Self {
        Self::new(crate::config::default_latency_classes())
    }
}
