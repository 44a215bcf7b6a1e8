//! Sealing: declaring a stream prefix immutable.
//!
//! A seal is a marker row, never a rewrite. The marker captures the count
//! and tip hash of the covered prefix atomically with its insertion, so a
//! later audit can confirm that nothing was added to or removed from the
//! sealed range. Enforcement lives in the store schema: rows at or under
//! the latest marker reject deletion, and committed rows reject update
//! everywhere.

use athanor_core::types::truncate_ms;
use athanor_core::{IntegrityConfig, Result, SealMarker, StreamKey};
use athanor_sqlite::{store, SqliteEventStore};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

#[derive(Clone)]
pub struct Sealer {
    store: Arc<SqliteEventStore>,
    config: IntegrityConfig,
}

impl Sealer {
    pub fn new(store: Arc<SqliteEventStore>, config: IntegrityConfig) -> Self {
        Self { store, config }
    }

    /// Seal the stream up to `up_to` (inclusive) and return the marker.
    pub fn seal(&self, stream: &StreamKey, up_to: DateTime<Utc>) -> Result<SealMarker> {
        let up_to = truncate_ms(&up_to);
        let marker = self.store.with_txn(|tx| {
            let (event_count, tip_hash) = store::seal_snapshot(tx, stream, up_to)?;
            let marker = SealMarker {
                stream: stream.clone(),
                up_to_time: up_to,
                event_count,
                tip_hash,
                sealed_at: truncate_ms(&Utc::now()),
            };
            store::insert_seal_marker(tx, &marker)?;
            Ok(marker)
        })?;

        tracing::info!(
            stream = %stream,
            up_to = %marker.up_to_time,
            events = marker.event_count,
            "stream sealed"
        );
        Ok(marker)
    }

    /// Seal everything older than `seal_after_days`, aligned down to a
    /// whole partition window. Returns `None` when the stream's latest
    /// seal already covers the eligible prefix.
    pub fn seal_due(&self, stream: &StreamKey) -> Result<Option<SealMarker>> {
        let cutoff = Utc::now() - Duration::days(i64::from(self.config.seal_after_days));
        let window_secs = i64::from(self.config.partition_days) * 86_400;
        let aligned_secs = cutoff.timestamp() - cutoff.timestamp().rem_euclid(window_secs);
        let Some(aligned) = Utc.timestamp_opt(aligned_secs, 0).single() else {
            return Ok(None);
        };

        let latest = self
            .store
            .with_write(|conn| store::latest_seal(conn, stream))?;
        if let Some(latest) = latest {
            if latest.up_to_time >= aligned {
                return Ok(None);
            }
        }

        self.seal(stream, aligned).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use athanor_core::{AthanorError, StoreConfig};
    use tempfile::TempDir;

    fn test_sealer(config: IntegrityConfig) -> (Sealer, Arc<SqliteEventStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            SqliteEventStore::open(&StoreConfig::new(dir.path().join("audit.db")).with_pool_size(1))
                .unwrap(),
        );
        (Sealer::new(store.clone(), config), store, dir)
    }

    #[test]
    fn sealing_an_empty_stream_records_zero() {
        let (sealer, _store, _dir) = test_sealer(IntegrityConfig::default());
        let stream = StreamKey::new("p", "e");
        let marker = sealer.seal(&stream, Utc::now()).unwrap();
        assert_eq!(marker.event_count, 0);
        assert!(marker.tip_hash.is_none());
    }

    #[test]
    fn seal_due_skips_when_already_covered() {
        let (sealer, _store, _dir) = test_sealer(IntegrityConfig::default());
        let stream = StreamKey::new("p", "e");

        let first = sealer.seal_due(&stream).unwrap();
        assert!(first.is_some());

        // The same window is already sealed.
        let second = sealer.seal_due(&stream).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn seal_due_aligns_to_partition_windows() {
        let config = IntegrityConfig {
            partition_days: 7,
            seal_after_days: 30,
            ..Default::default()
        };
        let (sealer, _store, _dir) = test_sealer(config);
        let marker = sealer
            .seal_due(&StreamKey::new("p", "e"))
            .unwrap()
            .unwrap();
        assert_eq!(marker.up_to_time.timestamp() % (7 * 86_400), 0);
    }

    #[test]
    fn sealed_rows_reject_deletion_through_any_connection(
    ) -> std::result::Result<(), AthanorError> {
        let (sealer, store, _dir) = test_sealer(IntegrityConfig::default());
        let stream = StreamKey::new("p", "e");

        store.with_write(|conn| {
            conn.execute(
                "INSERT INTO audit_events
                 (id, action, crud, created_at, received_at, hash, signature, project_id, environment_id)
                 VALUES ('e1', 'user.create', 'create', '2026-01-01T00:00:00.000Z',
                         '2026-01-01T00:00:00.000Z', 'h1', 's1', 'p', 'e')",
                [],
            )
            .map_err(|e| AthanorError::Storage(e.to_string()))?;
            Ok(())
        })?;

        sealer.seal(&stream, Utc::now())?;

        let err = store.with_write(|conn| {
            conn.execute("DELETE FROM audit_events WHERE id = 'e1'", [])
                .map_err(|e| AthanorError::Storage(e.to_string()))?;
            Ok(())
        });
        assert!(err.is_err());
        Ok(())
    }
}
