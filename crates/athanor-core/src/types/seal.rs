//! Seal markers: a declaration that no event at or under `up_to_time`
//! may change. Markers only ever accumulate; they never rewrite rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StreamKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealMarker {
    pub stream: StreamKey,
    /// Events with `received_at <= up_to_time` are sealed.
    pub up_to_time: DateTime<Utc>,
    /// Number of events covered at seal time.
    pub event_count: u64,
    /// Hash of the newest covered event; `None` for an empty range.
    pub tip_hash: Option<String>,
    pub sealed_at: DateTime<Utc>,
}
