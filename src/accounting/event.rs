use serde::Serialize;

/// Origin reserved for the end-of-stream marker; never accounted.
pub const COMPLETE_SENTINEL: &str = "COMPLETE";

/// One accounted request as produced by the ingest loop.
///
/// `request` is the raw request identifier (normally the URI); the
/// aggregator's request mapper resolves it into one or more request classes.
/// `elapsed` keeps the response-time field as it appeared in the log line so
/// validation happens at the single point that owns the statistics table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedEvent {
    pub origin: String,
    pub request: String,
    pub elapsed: String,
    pub status_code: u16,
}

impl ClassifiedEvent {
    pub fn new(
        origin: impl Into<String>,
        request: impl Into<String>,
        elapsed: impl Into<String>,
        status_code: u16,
    ) -> Self {
        Self {
            origin: origin.into(),
            request: request.into(),
            elapsed: elapsed.into(),
            status_code,
        }
    }

    /// Response time in microseconds, or `None` when the field is not a
    /// non-negative integer.
    pub fn elapsed_micros(&self) -> Option<u64> {
        self.elapsed.trim().parse().ok()
    }

    /// True when the origin is the reserved end-of-stream marker.
    pub fn has_reserved_origin(&self) -> bool {
        self.origin == COMPLETE_SENTINEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_micros_numeric() {
        let ev = ClassifiedEvent::new("dom1", "/a", "1234", 200);
        assert_eq!(ev.elapsed_micros(), Some(1234));
    }

    #[test]
    fn test_elapsed_micros_rejects_garbage() {
        assert_eq!(ClassifiedEvent::new("d", "/", "HONK1", 200).elapsed_micros(), None);
        assert_eq!(ClassifiedEvent::new("d", "/", "-5", 200).elapsed_micros(), None);
        assert_eq!(ClassifiedEvent::new("d", "/", "", 200).elapsed_micros(), None);
    }

    #[test]
    fn test_reserved_origin() {
        assert!(ClassifiedEvent::new(COMPLETE_SENTINEL, COMPLETE_SENTINEL, "0", 1).has_reserved_origin());
        assert!(ClassifiedEvent::new(COMPLETE_SENTINEL, "/a", "0", 200).has_reserved_origin());
        assert!(!ClassifiedEvent::new("dom1", COMPLETE_SENTINEL, "0", 200).has_reserved_origin());
    }
}
