pub mod event;
pub mod filter;
pub mod seal;
pub mod task;
pub mod validation;

pub use event::{Actor, AuditEvent, ChainTip, Crud, Group, NewEvent, Target};
pub use filter::{Cursor, EventFilter, EventPage};
pub use seal::SealMarker;
pub use task::{BacklogRow, IngestTask};
pub use validation::{FailureReason, ValidationFailure, ValidationReport};

use crate::error::{AthanorError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one audit stream. Every chain is scoped to exactly one
/// stream; events in different streams are independent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub project_id: String,
    pub environment_id: String,
}

impl StreamKey {
    pub fn new(project_id: impl Into<String>, environment_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            environment_id: environment_id.into(),
        }
    }

    /// Byte key for the stream lock manager. The unit separator keeps
    /// ("ab", "c") and ("a", "bc") distinct.
    pub fn lock_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.project_id.len() + self.environment_id.len() + 1);
        key.extend_from_slice(self.project_id.as_bytes());
        key.push(0x1f);
        key.extend_from_slice(self.environment_id.as_bytes());
        key
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_id, self.environment_id)
    }
}

/// Fixed-width RFC 3339 UTC with millisecond precision.
///
/// Every timestamp the store persists goes through this formatter so that
/// lexicographic comparison of the stored text equals chronological order.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp previously produced by [`format_ts`].
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AthanorError::Serialization(format!("bad timestamp '{raw}': {e}")))
}

/// Truncate to millisecond precision.
///
/// Server-assigned timestamps are truncated before they enter the
/// canonical form, so the digest computed at commit time equals the digest
/// recomputed after a store round-trip.
pub fn truncate_ms(ts: &DateTime<Utc>) -> DateTime<Utc> {
    chrono::TimeZone::timestamp_millis_opt(&Utc, ts.timestamp_millis())
        .single()
        .unwrap_or(*ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn lock_key_distinguishes_boundaries() {
        let a = StreamKey::new("ab", "c");
        let b = StreamKey::new("a", "bc");
        assert_ne!(a.lock_key(), b.lock_key());
        assert_eq!(a.lock_key(), StreamKey::new("ab", "c").lock_key());
    }

    #[test]
    fn timestamps_round_trip_with_millis() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap()
            + chrono::Duration::milliseconds(589);
        let raw = format_ts(&ts);
        assert_eq!(raw, "2026-03-14T09:26:53.589Z");
        assert_eq!(parse_ts(&raw).unwrap(), ts);
    }

    #[test]
    fn formatted_timestamps_sort_chronologically() {
        let early = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let late = early + chrono::Duration::milliseconds(1);
        assert!(format_ts(&early) < format_ts(&late));
    }

    #[test]
    fn truncate_ms_survives_format_round_trip() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()
            + chrono::Duration::microseconds(123_456);
        let truncated = truncate_ms(&ts);
        assert_ne!(ts, truncated);
        assert_eq!(parse_ts(&format_ts(&truncated)).unwrap(), truncated);
    }
}
