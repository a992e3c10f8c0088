//! Strictly increasing millisecond timestamps for one conversation.

use chrono::{DateTime, Duration, Utc};

/// Issues creation timestamps that never repeat within a conversation.
///
/// Timestamps are truncated to milliseconds, the precision they are stored at,
/// so sibling order is identical before and after a reload.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock {
    last: Option<DateTime<Utc>>,
}

impl MonotonicClock {
    /// Create a clock that will never issue anything at or before `last`.
    #[must_use]
    pub const fn starting_after(last: Option<DateTime<Utc>>) -> Self {
        Self { last }
    }

    /// Record an externally created timestamp.
    pub fn observe(&mut self, ts: DateTime<Utc>) {
        if self.last.is_none_or(|last| ts > last) {
            self.last = Some(ts);
        }
    }

    /// Next timestamp.
    pub fn tick(&mut self) -> DateTime<Utc> {
        let now = truncate_millis(Utc::now());
        let next = match self.last {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last = Some(next);
        next
    }
}

fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}
