use std::sync::Arc;

use chrono::{DateTime, Duration, Local};

/// Wall-clock source consulted by the log sink when deciding whether the
/// output file has to rotate.
///
/// `Manual` clocks share their instant between clones, so a test can keep one
/// handle and move time forward while the sink worker reads through another.
#[derive(Clone, Default)]
pub enum Clock {
    #[default]
    System,
    Manual(Arc<parking_lot::Mutex<DateTime<Local>>>),
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => f.write_str("Clock::System"),
            Self::Manual(now) => f.debug_tuple("Clock::Manual").field(&*now.lock()).finish(),
        }
    }
}

impl Clock {
    /// Create a manually driven clock starting at `start`.
    pub fn manual(start: DateTime<Local>) -> Self {
        Self::Manual(Arc::new(parking_lot::Mutex::new(start)))
    }

    /// Return the current local time.
    pub fn now(&self) -> DateTime<Local> {
        match self {
            Self::System => Local::now(),
            Self::Manual(now) => *now.lock(),
        }
    }

    /// Move a manual clock to `to`. No-op for the system clock.
    pub fn set(&self, to: DateTime<Local>) {
        if let Self::Manual(now) = self {
            *now.lock() = to;
        }
    }

    /// Move a manual clock forward by `by`. No-op for the system clock.
    pub fn advance(&self, by: Duration) {
        if let Self::Manual(now) = self {
            let mut now = now.lock();
            *now += by;
        }
    }
}
