//! The chain engine: serialized linking of new events to a stream's tip.
//!
//! For each append: take the stream lock, open an immediate transaction,
//! read the tip, assign identity and server time, link, canonicalize,
//! digest, sign, insert, commit. The lock guarantees at most one append
//! per stream is past the tip read at any moment; appends to different
//! streams run in parallel. The tip is never cached — it is re-read under
//! the lock on every append, so a restart cannot split the chain.

use athanor_core::types::truncate_ms;
use athanor_core::{
    canonical_event_bytes, AuditEvent, ChainTip, CryptoService, IngestTask, NewEvent, Result,
    StreamKey, StreamLocks,
};
use athanor_sqlite::{store, SqliteEventStore};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub struct ChainEngine {
    store: Arc<SqliteEventStore>,
    crypto: Arc<CryptoService>,
    locks: Arc<StreamLocks>,
}

impl ChainEngine {
    pub fn new(
        store: Arc<SqliteEventStore>,
        crypto: Arc<CryptoService>,
        locks: Arc<StreamLocks>,
    ) -> Self {
        Self {
            store,
            crypto,
            locks,
        }
    }

    /// Append a single event to its stream and return the committed row.
    ///
    /// `default_created_at` stands in for a missing client `created_at`
    /// (the accept time on first commit, the original accept time on a
    /// backlog replay). When `mark_task` is given, the ingest task flips
    /// to processed in the same transaction as the insert.
    pub fn append(
        &self,
        stream: &StreamKey,
        new: NewEvent,
        event_id: Uuid,
        default_created_at: Option<DateTime<Utc>>,
        mark_task: Option<Uuid>,
    ) -> Result<AuditEvent> {
        let _guard = self.locks.lock(stream)?;
        self.store.with_txn(|tx| {
            let tip = store::chain_tip(tx, stream)?;
            let event = self.build_link(stream, new, event_id, default_created_at, tip.as_ref())?;
            store::insert_event(tx, &event)?;
            if let Some(task_id) = mark_task {
                store::mark_ingest_processed(tx, task_id)?;
            }
            tracing::debug!(
                stream = %stream,
                event = %event.id,
                genesis = event.is_genesis(),
                "appended event to chain"
            );
            Ok(event)
        })
    }

    /// Append a staged batch in order under one lock and one transaction.
    ///
    /// Any failure rolls back the entire batch; no event from it reaches
    /// the store and the caller must resubmit.
    pub fn append_batch(
        &self,
        stream: &StreamKey,
        staged: &[IngestTask],
    ) -> Result<Vec<AuditEvent>> {
        let _guard = self.locks.lock(stream)?;
        self.store.with_txn(|tx| {
            let mut tip = store::chain_tip(tx, stream)?;
            let mut committed = Vec::with_capacity(staged.len());

            for task in staged {
                let event = self.build_link(
                    stream,
                    task.original_event.clone(),
                    task.new_event_id,
                    Some(task.received),
                    tip.as_ref(),
                )?;
                tip = Some(ChainTip {
                    hash: event.hash.clone(),
                    received_at: event.received_at,
                });
                committed.push(event);
            }

            store::insert_events(tx, &committed)?;
            for task in staged {
                store::mark_ingest_processed(tx, task.id)?;
            }

            tracing::debug!(stream = %stream, count = committed.len(), "appended batch to chain");
            Ok(committed)
        })
    }

    /// Assign identity, server time, and chain link, then digest and sign.
    fn build_link(
        &self,
        stream: &StreamKey,
        new: NewEvent,
        event_id: Uuid,
        default_created_at: Option<DateTime<Utc>>,
        tip: Option<&ChainTip>,
    ) -> Result<AuditEvent> {
        // Chain order is server time. If the clock reads at or before the
        // tip (replays, coarse clocks), nudge forward one millisecond so
        // (received_at, id) stays a total order matching commit order.
        let mut received_at = truncate_ms(&Utc::now());
        if let Some(tip) = tip {
            if received_at <= tip.received_at {
                received_at = tip.received_at + Duration::milliseconds(1);
            }
        }

        let created_at = truncate_ms(
            &new.created_at
                .or(default_created_at)
                .unwrap_or(received_at),
        );
        if created_at > received_at {
            tracing::debug!(
                stream = %stream,
                event = %event_id,
                "created_at is ahead of received_at; accepting as-is (advisory field)"
            );
        }

        let mut event = AuditEvent {
            id: event_id,
            external_id: new.external_id,
            action: new.action,
            crud: new.crud,
            actor: new.actor,
            target: new.target,
            group: new.group,
            description: new.description,
            component: new.component,
            version: new.version,
            source_ip: new.source_ip,
            is_anonymous: new.is_anonymous,
            is_failure: new.is_failure,
            fields: new.fields,
            metadata: new.metadata,
            created_at,
            received_at,
            hash: String::new(),
            previous_hash: tip.map(|t| t.hash.clone()),
            signature: String::new(),
            project_id: stream.project_id.clone(),
            environment_id: stream.environment_id.clone(),
        };

        let bytes = canonical_event_bytes(&event)?;
        event.hash = self.crypto.digest(&bytes);
        event.signature = self.crypto.sign(&bytes)?;
        Ok(event)
    }
}
