//! Schema bootstrap and connection configuration.
//!
//! Three tables plus seal markers. Immutability is enforced in the schema
//! itself: `audit_events` rows reject every UPDATE, and reject DELETE at
//! or under the stream's latest seal marker. The core never issues such
//! statements; the triggers catch everything else that shares the file.

use athanor_core::{AthanorError, Result, StoreConfig, SynchronousMode};
use rusqlite::Connection;

/// Create tables, indexes, and immutability triggers if needed.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS audit_events (
            id TEXT PRIMARY KEY,
            external_id TEXT,
            action TEXT NOT NULL,
            crud TEXT NOT NULL,
            actor_id TEXT,
            actor_name TEXT,
            actor_href TEXT,
            actor_fields TEXT,
            target_id TEXT,
            target_name TEXT,
            target_href TEXT,
            target_type TEXT,
            target_fields TEXT,
            group_id TEXT,
            group_name TEXT,
            description TEXT,
            component TEXT,
            version TEXT,
            source_ip TEXT,
            is_anonymous INTEGER NOT NULL DEFAULT 0,
            is_failure INTEGER NOT NULL DEFAULT 0,
            fields TEXT NOT NULL DEFAULT '{}',
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            received_at TEXT NOT NULL,
            hash TEXT NOT NULL,
            previous_hash TEXT,
            signature TEXT NOT NULL,
            project_id TEXT NOT NULL,
            environment_id TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_events_stream
            ON audit_events(project_id, environment_id, received_at, id);
        CREATE INDEX IF NOT EXISTS idx_audit_events_created_at
            ON audit_events(created_at);
        CREATE INDEX IF NOT EXISTS idx_audit_events_actor_id
            ON audit_events(actor_id);
        CREATE INDEX IF NOT EXISTS idx_audit_events_target_id
            ON audit_events(target_id);
        CREATE INDEX IF NOT EXISTS idx_audit_events_action
            ON audit_events(action);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_audit_events_external_id
            ON audit_events(project_id, environment_id, external_id)
            WHERE external_id IS NOT NULL;

        CREATE TABLE IF NOT EXISTS ingest_task (
            id TEXT PRIMARY KEY,
            original_event TEXT NOT NULL,
            project_id TEXT NOT NULL,
            environment_id TEXT NOT NULL,
            new_event_id TEXT NOT NULL,
            received TEXT NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS backlog (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL,
            environment_id TEXT NOT NULL,
            new_event_id TEXT NOT NULL,
            received TEXT NOT NULL,
            original_event TEXT NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_attempt TEXT,
            last_error TEXT,
            dead INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_backlog_stream
            ON backlog(project_id, environment_id, id);
        CREATE INDEX IF NOT EXISTS idx_backlog_live
            ON backlog(processed, dead, id);

        CREATE TABLE IF NOT EXISTS seal_markers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL,
            environment_id TEXT NOT NULL,
            up_to_time TEXT NOT NULL,
            event_count INTEGER NOT NULL,
            tip_hash TEXT,
            sealed_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_seal_markers_stream
            ON seal_markers(project_id, environment_id, up_to_time);

        CREATE TRIGGER IF NOT EXISTS audit_events_immutable_update
        BEFORE UPDATE ON audit_events
        BEGIN
            SELECT RAISE(ABORT, 'audit events are immutable');
        END;

        CREATE TRIGGER IF NOT EXISTS audit_events_sealed_delete
        BEFORE DELETE ON audit_events
        WHEN OLD.received_at <= COALESCE(
            (SELECT MAX(up_to_time) FROM seal_markers
             WHERE project_id = OLD.project_id
               AND environment_id = OLD.environment_id),
            '')
        BEGIN
            SELECT RAISE(ABORT, 'audit event is sealed');
        END;",
    )
    .map_err(|e| AthanorError::Storage(format!("schema bootstrap failed: {e}")))?;

    Ok(())
}

/// Pragmas a `StoreConfig` translates to. WAL is what lets the reader
/// stack run concurrently with the single writer; the schema has no
/// foreign keys, so no relational integrity pragmas apply.
fn pragmas_for(config: &StoreConfig) -> Vec<(&'static str, String)> {
    let mut pragmas = Vec::new();
    if config.wal_mode {
        pragmas.push(("journal_mode", "WAL".to_string()));
    }
    pragmas.push((
        "synchronous",
        match config.synchronous {
            SynchronousMode::Full => "FULL",
            SynchronousMode::Normal => "NORMAL",
            SynchronousMode::Off => "OFF",
        }
        .to_string(),
    ));
    pragmas.push(("cache_size", config.cache_size.to_string()));
    pragmas
}

/// Apply pragmas from the store configuration.
pub fn configure_connection(conn: &Connection, config: &StoreConfig) -> Result<()> {
    for (pragma, value) in pragmas_for(config) {
        conn.pragma_update(None, pragma, &value).map_err(|e| {
            AthanorError::InvalidConfiguration(format!("pragma {pragma}={value}: {e}"))
        })?;
    }
    Ok(())
}
