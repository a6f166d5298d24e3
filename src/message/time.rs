use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Unix timestamp in milliseconds.
///
/// Every ledger column that holds a point in time (`lock_time`,
/// `next_retry_time`, `create_time`, `update_time`) uses this
/// representation, so lock-expiry checks reduce to integer comparisons
/// inside a single SQL statement. Callers pass `now` explicitly into
/// provider operations; nothing reads an ambient clock mid-statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixMillis(pub i64);

impl UnixMillis {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(i64::try_from(millis).unwrap_or(i64::MAX))
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// This instant plus `duration`, saturating at the representable maximum.
    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_millis(duration)))
    }

    /// This instant minus `duration`, saturating at the representable minimum.
    pub fn saturating_sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_millis(duration)))
    }

    /// Whether this timestamp is at least `timeout` in the past relative to `now`.
    ///
    /// This is the staleness test applied to `lock_time`: a lock older than
    /// the processing timeout is presumed abandoned by a crashed owner.
    pub fn is_expired(self, now: Self, timeout: Duration) -> bool {
        self.0 <= now.saturating_sub(timeout).0
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
