//! Query filter and keyset pagination types.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{format_ts, parse_ts, AuditEvent};
use crate::error::{AthanorError, Result};

/// Filter over a single stream. Project and environment come from the
/// call's scope; everything here is optional narrowing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    /// Substring match over `description`.
    #[serde(default)]
    pub description_contains: Option<String>,
    /// Page size (default: 100).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Opaque keyset cursor from a previous page.
    #[serde(default)]
    pub cursor: Option<String>,
    /// Also compute the total match count (default: false; it costs a
    /// second scan).
    #[serde(default)]
    pub with_total: bool,
}

fn default_limit() -> usize {
    100
}

impl EventFilter {
    pub fn new() -> Self {
        Self {
            limit: default_limit(),
            ..Default::default()
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_actor_id(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }
}

/// Keyset cursor: the `(received_at, id)` position after which the next
/// page starts. Deep `OFFSET` scans are never issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub received_at: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    pub fn encode(&self) -> String {
        BASE64.encode(format!("{}|{}", format_ts(&self.received_at), self.id))
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(raw)
            .map_err(|_| AthanorError::Validation("malformed cursor".into()))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| AthanorError::Validation("malformed cursor".into()))?;
        let (ts, id) = text
            .split_once('|')
            .ok_or_else(|| AthanorError::Validation("malformed cursor".into()))?;
        Ok(Self {
            received_at: parse_ts(ts)
                .map_err(|_| AthanorError::Validation("malformed cursor".into()))?,
            id: Uuid::parse_str(id)
                .map_err(|_| AthanorError::Validation("malformed cursor".into()))?,
        })
    }
}

/// One page of query results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<AuditEvent>,
    /// Present when more rows may follow; feed back into the next filter.
    pub next_cursor: Option<String>,
    /// Total match count, when requested.
    pub total: Option<u64>,
}
