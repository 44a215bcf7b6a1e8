//! Transient ingest tasks and the persistent backlog row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{event::NewEvent, StreamKey};

/// Durable record of an accepted submission, written before the chain
/// append so that a crash between accept and commit loses nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestTask {
    pub id: Uuid,
    pub stream: StreamKey,
    /// Event id reserved at accept time; the committed row reuses it.
    pub new_event_id: Uuid,
    pub received: DateTime<Utc>,
    pub original_event: NewEvent,
    pub processed: bool,
}

impl IngestTask {
    pub fn accept(stream: StreamKey, new_event_id: Uuid, original_event: NewEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream,
            new_event_id,
            received: Utc::now(),
            original_event,
            processed: false,
        }
    }
}

/// A failed commit awaiting replay. FIFO within a stream by `id`.
#[derive(Debug, Clone)]
pub struct BacklogRow {
    pub id: i64,
    pub stream: StreamKey,
    pub new_event_id: Uuid,
    pub received: DateTime<Utc>,
    pub original_event: NewEvent,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
