//! ---
//! xmq_section: "01-core-functionality"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Shared primitives and utilities for the messaging runtime."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Wall-clock time split into seconds and nanoseconds, as carried in message headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct WallClock {
    pub secs: i64,
    pub nanos: u32,
}

impl WallClock {
    pub fn now() -> Self {
        Self::from(Utc::now())
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.secs, self.nanos).single()
    }
}

impl From<DateTime<Utc>> for WallClock {
    fn from(value: DateTime<Utc>) -> Self {
        Self {
            secs: value.timestamp(),
            nanos: value.timestamp_subsec_nanos(),
        }
    }
}

/// Elapsed time since `since`, clamped to zero when the clock stepped backwards.
pub fn age(since: DateTime<Utc>) -> Duration {
    (Utc::now() - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_clock_roundtrips_through_chrono() {
        let now = WallClock::now();
        let back = WallClock::from(now.to_datetime().expect("valid timestamp"));
        assert_eq!(now, back);
    }

    #[test]
    fn future_timestamps_have_zero_age() {
        let future = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(age(future), Duration::ZERO);
    }
}
