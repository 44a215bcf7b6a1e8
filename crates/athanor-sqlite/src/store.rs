//! SQLite-backed event store.
//!
//! One write connection guarded by a mutex carries every mutation; reads
//! check out read-only connections from a capped, lazily filled idle
//! stack. Row-level operations are free functions over `&Connection` so
//! the chain engine can compose them inside its own transaction, and the
//! checked-out read path can reuse the same queries.
//!
//! Every scoped statement binds `project_id` and `environment_id`; values
//! are always bound, never interpolated.

use athanor_core::types::{format_ts, parse_ts};
use athanor_core::{
    Actor, AthanorError, AuditEvent, BacklogRow, ChainTip, Crud, Cursor, EventFilter, Group,
    IngestTask, NewEvent, Result, SealMarker, StoreConfig, StreamKey, Target,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, ToSql, Transaction,
    TransactionBehavior};
use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use uuid::Uuid;

use crate::schema;

const EVENT_COLUMNS: &str = "id, external_id, action, crud, \
    actor_id, actor_name, actor_href, actor_fields, \
    target_id, target_name, target_href, target_type, target_fields, \
    group_id, group_name, \
    description, component, version, source_ip, is_anonymous, is_failure, \
    fields, metadata, created_at, received_at, \
    hash, previous_hash, signature, project_id, environment_id";

/// Persistent store for events, ingest tasks, backlog rows, and seals.
///
/// Readers are capped at `pool_size` and recycled through an idle stack:
/// a connection is opened the first time a reader slot is actually used
/// and handed back on [`ReadGuard`] drop, so an idle store holds no read
/// connections at all.
#[derive(Debug)]
pub struct SqliteEventStore {
    write: Mutex<Connection>,
    idle_readers: Mutex<Vec<Connection>>,
    reader_slots: Semaphore,
    read_timeout: Duration,
    path: PathBuf,
}

/// A checked-out read-only connection. Derefs to [`Connection`]; the
/// connection returns to the idle stack and the slot frees on drop.
#[derive(Debug)]
pub struct ReadGuard<'a> {
    conn: Option<Connection>,
    store: &'a SqliteEventStore,
    _slot: SemaphorePermit<'a>,
}

impl Deref for ReadGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Present from checkout until drop.
        self.conn.as_ref().expect("read connection already returned")
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.store.idle_readers.lock().push(conn);
        }
    }
}

impl SqliteEventStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(&config.path).map_err(db_err)?;
        schema::configure_connection(&conn, config)?;
        schema::init_schema(&conn)?;

        if config.debug {
            conn.trace(Some(|sql: &str| {
                tracing::debug!(target: "athanor::sql", "{sql}");
            }));
        }

        Ok(Self {
            write: Mutex::new(conn),
            idle_readers: Mutex::new(Vec::new()),
            reader_slots: Semaphore::new(config.pool_size),
            read_timeout: Duration::from_millis(config.acquire_timeout_ms),
            path: config.path.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check out a read-only connection, waiting up to the configured
    /// acquire timeout for a free slot.
    pub async fn reader(&self) -> Result<ReadGuard<'_>> {
        let slot = match tokio::time::timeout(self.read_timeout, self.reader_slots.acquire()).await
        {
            Ok(Ok(slot)) => slot,
            Ok(Err(_)) => {
                return Err(AthanorError::Storage("reader slots closed".into()));
            }
            Err(_) => {
                return Err(AthanorError::Timeout(format!(
                    "no read connection available within {}ms",
                    self.read_timeout.as_millis()
                )));
            }
        };

        let conn = match self.idle_readers.lock().pop() {
            Some(conn) => conn,
            None => self.open_read_connection()?,
        };
        Ok(ReadGuard {
            conn: Some(conn),
            store: self,
            _slot: slot,
        })
    }

    /// Open an extra read-only connection, for long scans (verification,
    /// WORM export) that should not hold a reader slot.
    pub fn open_read_connection(&self) -> Result<Connection> {
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(db_err)
    }

    /// Run `f` against the write connection, outside any transaction.
    pub fn with_write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.write.lock();
        f(&conn)
    }

    /// Run `f` inside an immediate transaction; commit on `Ok`, roll back
    /// on `Err`. Immediate mode takes the write lock up front so the
    /// chain-tip read and the insert see one consistent world.
    pub fn with_txn<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.write.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let out = f(&tx)?;
        tx.commit().map_err(db_err)?;
        Ok(out)
    }
}

fn db_err(e: rusqlite::Error) -> AthanorError {
    if let rusqlite::Error::SqliteFailure(inner, _) = &e {
        if matches!(
            inner.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ) {
            return AthanorError::ChainConflict(e.to_string());
        }
    }
    AthanorError::Storage(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| AthanorError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| AthanorError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// audit_events
// ---------------------------------------------------------------------------

/// Insert one committed event. Runs inside the caller's transaction.
pub fn insert_event(conn: &Connection, event: &AuditEvent) -> Result<()> {
    let (actor_id, actor_name, actor_href, actor_fields) = match &event.actor {
        Some(actor) => (
            Some(actor.id.clone()),
            actor.name.clone(),
            actor.href.clone(),
            Some(to_json(&actor.fields)?),
        ),
        None => (None, None, None, None),
    };
    let (target_id, target_name, target_href, target_type, target_fields) = match &event.target {
        Some(target) => (
            Some(target.id.clone()),
            target.name.clone(),
            target.href.clone(),
            target.kind.clone(),
            Some(to_json(&target.fields)?),
        ),
        None => (None, None, None, None, None),
    };
    let (group_id, group_name) = match &event.group {
        Some(group) => (Some(group.id.clone()), group.name.clone()),
        None => (None, None),
    };

    conn.execute(
        "INSERT INTO audit_events (id, external_id, action, crud, \
            actor_id, actor_name, actor_href, actor_fields, \
            target_id, target_name, target_href, target_type, target_fields, \
            group_id, group_name, \
            description, component, version, source_ip, is_anonymous, is_failure, \
            fields, metadata, created_at, received_at, \
            hash, previous_hash, signature, project_id, environment_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
            ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)",
        params![
            event.id.to_string(),
            event.external_id,
            event.action,
            event.crud.as_str(),
            actor_id,
            actor_name,
            actor_href,
            actor_fields,
            target_id,
            target_name,
            target_href,
            target_type,
            target_fields,
            group_id,
            group_name,
            event.description,
            event.component,
            event.version,
            event.source_ip,
            event.is_anonymous,
            event.is_failure,
            to_json(&event.fields)?,
            to_json(&event.metadata)?,
            format_ts(&event.created_at),
            format_ts(&event.received_at),
            event.hash,
            event.previous_hash,
            event.signature,
            event.project_id,
            event.environment_id,
        ],
    )
    .map_err(|e| match &e {
        rusqlite::Error::SqliteFailure(inner, Some(msg))
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
                && msg.contains("external_id") =>
        {
            AthanorError::DuplicateExternalId(event.external_id.clone().unwrap_or_default())
        }
        _ => db_err(e),
    })?;

    Ok(())
}

/// Insert a batch of committed events. Atomic when run inside one
/// transaction, which is how the chain engine calls it.
pub fn insert_events(conn: &Connection, events: &[AuditEvent]) -> Result<()> {
    for event in events {
        insert_event(conn, event)?;
    }
    Ok(())
}

/// Latest chain link of a stream. Must be called with the stream lock
/// held; the result is stale the moment the lock is released.
pub fn chain_tip(conn: &Connection, stream: &StreamKey) -> Result<Option<ChainTip>> {
    conn.query_row(
        "SELECT hash, received_at FROM audit_events \
         WHERE project_id = ?1 AND environment_id = ?2 \
         ORDER BY received_at DESC, id DESC LIMIT 1",
        params![stream.project_id, stream.environment_id],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
            ))
        },
    )
    .optional()
    .map_err(db_err)?
    .map(|(hash, received_at)| {
        Ok(ChainTip {
            hash,
            received_at: parse_ts(&received_at)?,
        })
    })
    .transpose()
}

/// Scoped single-event lookup.
pub fn get_event(conn: &Connection, stream: &StreamKey, id: Uuid) -> Result<Option<AuditEvent>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM audit_events \
             WHERE id = ?1 AND project_id = ?2 AND environment_id = ?3"
        ))
        .map_err(db_err)?;

    stmt.query_row(
        params![id.to_string(), stream.project_id, stream.environment_id],
        event_from_row,
    )
    .optional()
    .map_err(db_err)?
    .transpose()
}

/// Keyset-paginated query over one stream. Returns the page plus the
/// cursor positioned after its last row when more rows may follow.
pub fn query_events(
    conn: &Connection,
    stream: &StreamKey,
    filter: &EventFilter,
) -> Result<(Vec<AuditEvent>, Option<Cursor>)> {
    let mut sql = format!(
        "SELECT {EVENT_COLUMNS} FROM audit_events \
         WHERE project_id = ?1 AND environment_id = ?2"
    );
    let mut owned: Vec<Box<dyn ToSql>> = vec![
        Box::new(stream.project_id.clone()),
        Box::new(stream.environment_id.clone()),
    ];
    push_filter_clauses(&mut sql, &mut owned, filter)?;

    if let Some(raw) = &filter.cursor {
        let cursor = Cursor::decode(raw)?;
        owned.push(Box::new(format_ts(&cursor.received_at)));
        let ts_idx = owned.len();
        owned.push(Box::new(cursor.id.to_string()));
        let id_idx = owned.len();
        sql.push_str(&format!(
            " AND (received_at > ?{ts_idx} OR (received_at = ?{ts_idx} AND id > ?{id_idx}))"
        ));
    }

    // One extra row decides whether a next page exists.
    owned.push(Box::new((filter.limit + 1) as i64));
    sql.push_str(&format!(
        " ORDER BY received_at ASC, id ASC LIMIT ?{}",
        owned.len()
    ));

    let refs: Vec<&dyn ToSql> = owned.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt.query_map(&refs[..], event_from_row).map_err(db_err)?;

    let mut events = rows
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

    let next_cursor = if events.len() > filter.limit {
        events.truncate(filter.limit);
        events.last().map(|last| Cursor {
            received_at: last.received_at,
            id: last.id,
        })
    } else {
        None
    };

    Ok((events, next_cursor))
}

/// Total match count for a filter, ignoring pagination.
pub fn count_events(conn: &Connection, stream: &StreamKey, filter: &EventFilter) -> Result<u64> {
    let mut sql = String::from(
        "SELECT COUNT(*) FROM audit_events \
         WHERE project_id = ?1 AND environment_id = ?2",
    );
    let mut owned: Vec<Box<dyn ToSql>> = vec![
        Box::new(stream.project_id.clone()),
        Box::new(stream.environment_id.clone()),
    ];
    push_filter_clauses(&mut sql, &mut owned, filter)?;

    let refs: Vec<&dyn ToSql> = owned.iter().map(|p| p.as_ref()).collect();
    conn.query_row(&sql, &refs[..], |row| row.get::<_, i64>(0))
        .map(|n| n as u64)
        .map_err(db_err)
}

fn push_filter_clauses(
    sql: &mut String,
    owned: &mut Vec<Box<dyn ToSql>>,
    filter: &EventFilter,
) -> Result<()> {
    if let Some(action) = &filter.action {
        owned.push(Box::new(action.clone()));
        sql.push_str(&format!(" AND action = ?{}", owned.len()));
    }
    if let Some(actor_id) = &filter.actor_id {
        owned.push(Box::new(actor_id.clone()));
        sql.push_str(&format!(" AND actor_id = ?{}", owned.len()));
    }
    if let Some(target_id) = &filter.target_id {
        owned.push(Box::new(target_id.clone()));
        sql.push_str(&format!(" AND target_id = ?{}", owned.len()));
    }
    if let Some(start) = &filter.start {
        owned.push(Box::new(format_ts(start)));
        sql.push_str(&format!(" AND received_at >= ?{}", owned.len()));
    }
    if let Some(end) = &filter.end {
        owned.push(Box::new(format_ts(end)));
        sql.push_str(&format!(" AND received_at <= ?{}", owned.len()));
    }
    if let Some(text) = &filter.description_contains {
        // LIKE wildcards in the needle are literal characters to the caller.
        let escaped = text.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        owned.push(Box::new(format!("%{escaped}%")));
        sql.push_str(&format!(
            " AND description LIKE ?{} ESCAPE '\\'",
            owned.len()
        ));
    }
    Ok(())
}

/// Stream a time range in chain order, invoking `f` per event.
pub fn for_each_in_range(
    conn: &Connection,
    stream: &StreamKey,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    mut f: impl FnMut(AuditEvent) -> Result<()>,
) -> Result<u64> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM audit_events \
             WHERE project_id = ?1 AND environment_id = ?2 \
               AND received_at >= ?3 AND received_at <= ?4 \
             ORDER BY received_at ASC, id ASC"
        ))
        .map_err(db_err)?;

    let rows = stmt
        .query_map(
            params![
                stream.project_id,
                stream.environment_id,
                format_ts(&start),
                format_ts(&end)
            ],
            event_from_row,
        )
        .map_err(db_err)?;

    let mut count = 0u64;
    for row in rows {
        f(row.map_err(db_err)??)?;
        count += 1;
    }
    Ok(count)
}

/// Collect a time range in chain order.
pub fn events_in_range(
    conn: &Connection,
    stream: &StreamKey,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<AuditEvent>> {
    let mut events = Vec::new();
    for_each_in_range(conn, stream, start, end, |event| {
        events.push(event);
        Ok(())
    })?;
    Ok(events)
}

/// All streams with at least one committed event.
pub fn list_streams(conn: &Connection) -> Result<Vec<StreamKey>> {
    let mut stmt = conn
        .prepare("SELECT DISTINCT project_id, environment_id FROM audit_events")
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(StreamKey::new(
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
            ))
        })
        .map_err(db_err)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<AuditEvent>> {
    // Two-level result: rusqlite errors surface to query_map, our own
    // decoding errors are folded by the caller.
    let id: String = row.get(0)?;
    let external_id: Option<String> = row.get(1)?;
    let action: String = row.get(2)?;
    let crud: String = row.get(3)?;
    let actor_id: Option<String> = row.get(4)?;
    let actor_name: Option<String> = row.get(5)?;
    let actor_href: Option<String> = row.get(6)?;
    let actor_fields: Option<String> = row.get(7)?;
    let target_id: Option<String> = row.get(8)?;
    let target_name: Option<String> = row.get(9)?;
    let target_href: Option<String> = row.get(10)?;
    let target_type: Option<String> = row.get(11)?;
    let target_fields: Option<String> = row.get(12)?;
    let group_id: Option<String> = row.get(13)?;
    let group_name: Option<String> = row.get(14)?;
    let description: Option<String> = row.get(15)?;
    let component: Option<String> = row.get(16)?;
    let version: Option<String> = row.get(17)?;
    let source_ip: Option<String> = row.get(18)?;
    let is_anonymous: bool = row.get(19)?;
    let is_failure: bool = row.get(20)?;
    let fields: String = row.get(21)?;
    let metadata: String = row.get(22)?;
    let created_at: String = row.get(23)?;
    let received_at: String = row.get(24)?;
    let hash: String = row.get(25)?;
    let previous_hash: Option<String> = row.get(26)?;
    let signature: String = row.get(27)?;
    let project_id: String = row.get(28)?;
    let environment_id: String = row.get(29)?;

    Ok((|| {
        let actor = match actor_id {
            Some(id) => Some(Actor {
                id,
                name: actor_name,
                href: actor_href,
                fields: match actor_fields {
                    Some(raw) => from_json(&raw)?,
                    None => BTreeMap::new(),
                },
            }),
            None => None,
        };
        let target = match target_id {
            Some(id) => Some(Target {
                id,
                name: target_name,
                href: target_href,
                kind: target_type,
                fields: match target_fields {
                    Some(raw) => from_json(&raw)?,
                    None => BTreeMap::new(),
                },
            }),
            None => None,
        };
        let group = group_id.map(|id| Group {
            id,
            name: group_name,
        });

        Ok(AuditEvent {
            id: Uuid::parse_str(&id)
                .map_err(|e| AthanorError::Serialization(format!("bad event id: {e}")))?,
            external_id,
            action,
            crud: Crud::from_str(&crud)?,
            actor,
            target,
            group,
            description,
            component,
            version,
            source_ip,
            is_anonymous,
            is_failure,
            fields: from_json(&fields)?,
            metadata: from_json(&metadata)?,
            created_at: parse_ts(&created_at)?,
            received_at: parse_ts(&received_at)?,
            hash,
            previous_hash,
            signature,
            project_id,
            environment_id,
        })
    })())
}

// ---------------------------------------------------------------------------
// ingest_task
// ---------------------------------------------------------------------------

/// Persist an accepted submission before the chain append.
pub fn insert_ingest_task(conn: &Connection, task: &IngestTask) -> Result<()> {
    conn.execute(
        "INSERT INTO ingest_task \
            (id, original_event, project_id, environment_id, new_event_id, received, processed) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
        params![
            task.id.to_string(),
            to_json(&task.original_event)?,
            task.stream.project_id,
            task.stream.environment_id,
            task.new_event_id.to_string(),
            format_ts(&task.received),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

pub fn mark_ingest_processed(conn: &Connection, task_id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE ingest_task SET processed = 1 WHERE id = ?1",
        params![task_id.to_string()],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Remove a staged task whose batch definitively failed; the caller is
/// told to resubmit, so nothing should keep replaying it.
pub fn delete_ingest_task(conn: &Connection, task_id: Uuid) -> Result<()> {
    conn.execute(
        "DELETE FROM ingest_task WHERE id = ?1",
        params![task_id.to_string()],
    )
    .map_err(db_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// backlog
// ---------------------------------------------------------------------------

/// Move a failed accept to the backlog and mark the ingest task handled.
/// Runs both statements in the caller's connection; callers that need
/// atomicity wrap it in a transaction.
pub fn move_to_backlog(conn: &Connection, task: &IngestTask, error: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO backlog \
            (project_id, environment_id, new_event_id, received, original_event, \
             processed, attempts, last_error, dead) \
         VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, 0)",
        params![
            task.stream.project_id,
            task.stream.environment_id,
            task.new_event_id.to_string(),
            format_ts(&task.received),
            to_json(&task.original_event)?,
            error,
        ],
    )
    .map_err(db_err)?;
    let backlog_id = conn.last_insert_rowid();

    mark_ingest_processed(conn, task.id)?;
    Ok(backlog_id)
}

/// Unprocessed, non-dead rows for one stream.
pub fn backlog_depth(conn: &Connection, stream: &StreamKey) -> Result<u64> {
    conn.query_row(
        "SELECT COUNT(*) FROM backlog \
         WHERE project_id = ?1 AND environment_id = ?2 AND processed = 0 AND dead = 0",
        params![stream.project_id, stream.environment_id],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n as u64)
    .map_err(db_err)
}

/// Oldest live backlog rows, grouped by stream so a worker drains one
/// stream at a time in original accept order.
pub fn fetch_backlog_batch(conn: &Connection, limit: usize) -> Result<Vec<BacklogRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, project_id, environment_id, new_event_id, received, \
                    original_event, attempts, last_attempt, last_error \
             FROM backlog \
             WHERE processed = 0 AND dead = 0 \
             ORDER BY project_id, environment_id, id \
             LIMIT ?1",
        )
        .map_err(db_err)?;

    let rows = stmt
        .query_map(params![limit as i64], backlog_from_row)
        .map_err(db_err)?;

    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?
        .into_iter()
        .collect()
}

fn backlog_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<BacklogRow>> {
    let id: i64 = row.get(0)?;
    let project_id: String = row.get(1)?;
    let environment_id: String = row.get(2)?;
    let new_event_id: String = row.get(3)?;
    let received: String = row.get(4)?;
    let original_event: String = row.get(5)?;
    let attempts: i64 = row.get(6)?;
    let last_attempt: Option<String> = row.get(7)?;
    let last_error: Option<String> = row.get(8)?;

    Ok((|| {
        Ok(BacklogRow {
            id,
            stream: StreamKey::new(project_id, environment_id),
            new_event_id: Uuid::parse_str(&new_event_id)
                .map_err(|e| AthanorError::Serialization(format!("bad event id: {e}")))?,
            received: parse_ts(&received)?,
            original_event: from_json::<NewEvent>(&original_event)?,
            attempts: attempts as u32,
            last_attempt: last_attempt.as_deref().map(parse_ts).transpose()?,
            last_error,
        })
    })())
}

pub fn mark_backlog_processed(conn: &Connection, backlog_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE backlog SET processed = 1 WHERE id = ?1",
        params![backlog_id],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Record a failed replay; returns the new attempt count.
pub fn bump_attempts(conn: &Connection, backlog_id: i64, error: &str) -> Result<u32> {
    conn.execute(
        "UPDATE backlog SET attempts = attempts + 1, last_attempt = ?1, last_error = ?2 \
         WHERE id = ?3",
        params![format_ts(&Utc::now()), error, backlog_id],
    )
    .map_err(db_err)?;

    conn.query_row(
        "SELECT attempts FROM backlog WHERE id = ?1",
        params![backlog_id],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n as u32)
    .map_err(db_err)
}

/// Flag a row dead-letter. It stays on disk for operators; the worker
/// stops fetching it.
pub fn mark_backlog_dead(conn: &Connection, backlog_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE backlog SET dead = 1 WHERE id = ?1",
        params![backlog_id],
    )
    .map_err(db_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// seal_markers
// ---------------------------------------------------------------------------

/// Count and tip hash of a stream's prefix up to `up_to`. Run inside the
/// same transaction as the marker insert so the pair is atomic.
pub fn seal_snapshot(
    conn: &Connection,
    stream: &StreamKey,
    up_to: DateTime<Utc>,
) -> Result<(u64, Option<String>)> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM audit_events \
             WHERE project_id = ?1 AND environment_id = ?2 AND received_at <= ?3",
            params![stream.project_id, stream.environment_id, format_ts(&up_to)],
            |row| row.get(0),
        )
        .map_err(db_err)?;

    let tip_hash: Option<String> = conn
        .query_row(
            "SELECT hash FROM audit_events \
             WHERE project_id = ?1 AND environment_id = ?2 AND received_at <= ?3 \
             ORDER BY received_at DESC, id DESC LIMIT 1",
            params![stream.project_id, stream.environment_id, format_ts(&up_to)],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;

    Ok((count as u64, tip_hash))
}

pub fn insert_seal_marker(conn: &Connection, marker: &SealMarker) -> Result<()> {
    conn.execute(
        "INSERT INTO seal_markers \
            (project_id, environment_id, up_to_time, event_count, tip_hash, sealed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            marker.stream.project_id,
            marker.stream.environment_id,
            format_ts(&marker.up_to_time),
            marker.event_count as i64,
            marker.tip_hash,
            format_ts(&marker.sealed_at),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

pub fn latest_seal(conn: &Connection, stream: &StreamKey) -> Result<Option<SealMarker>> {
    conn.query_row(
        "SELECT project_id, environment_id, up_to_time, event_count, tip_hash, sealed_at \
         FROM seal_markers \
         WHERE project_id = ?1 AND environment_id = ?2 \
         ORDER BY up_to_time DESC LIMIT 1",
        params![stream.project_id, stream.environment_id],
        seal_from_row,
    )
    .optional()
    .map_err(db_err)?
    .transpose()
}

pub fn list_seal_markers(conn: &Connection, stream: &StreamKey) -> Result<Vec<SealMarker>> {
    let mut stmt = conn
        .prepare(
            "SELECT project_id, environment_id, up_to_time, event_count, tip_hash, sealed_at \
             FROM seal_markers \
             WHERE project_id = ?1 AND environment_id = ?2 \
             ORDER BY up_to_time ASC",
        )
        .map_err(db_err)?;

    let rows = stmt
        .query_map(
            params![stream.project_id, stream.environment_id],
            seal_from_row,
        )
        .map_err(db_err)?;

    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?
        .into_iter()
        .collect()
}

fn seal_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<SealMarker>> {
    let project_id: String = row.get(0)?;
    let environment_id: String = row.get(1)?;
    let up_to_time: String = row.get(2)?;
    let event_count: i64 = row.get(3)?;
    let tip_hash: Option<String> = row.get(4)?;
    let sealed_at: String = row.get(5)?;

    Ok((|| {
        Ok(SealMarker {
            stream: StreamKey::new(project_id, environment_id),
            up_to_time: parse_ts(&up_to_time)?,
            event_count: event_count as u64,
            tip_hash,
            sealed_at: parse_ts(&sealed_at)?,
        })
    })())
}
