//! Two-phase ingest: accept, then commit.
//!
//! Accept validates the submission's shape and writes a durable
//! `ingest_task` row before any chain work happens, so the event survives
//! a crash between accept and commit. Commit delegates to the chain
//! engine. A failed single-event commit moves the task to the backlog for
//! the worker to replay; a failed bulk commit rolls back whole and tells
//! the caller to resubmit.

use athanor_core::{
    AthanorError, AuditEvent, IngestConfig, IngestTask, NewEvent, Result, StreamKey,
};
use athanor_sqlite::{store, SqliteEventStore};
use std::sync::Arc;
use uuid::Uuid;

use crate::chain::ChainEngine;

pub const MAX_ACTION_LEN: usize = 255;
pub const MAX_ID_LEN: usize = 255;
pub const MAX_NAME_LEN: usize = 512;
pub const MAX_DESCRIPTION_LEN: usize = 4096;

pub struct IngestPipeline {
    store: Arc<SqliteEventStore>,
    chain: Arc<ChainEngine>,
    config: IngestConfig,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<SqliteEventStore>,
        chain: Arc<ChainEngine>,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            chain,
            config,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Shape validation. Caller errors surface here and never enter the
    /// pipeline.
    pub fn validate(new: &NewEvent) -> Result<()> {
        if new.action.is_empty() {
            return Err(AthanorError::Validation("action is required".into()));
        }
        if new.action.len() > MAX_ACTION_LEN {
            return Err(AthanorError::Validation(format!(
                "action exceeds {MAX_ACTION_LEN} characters"
            )));
        }
        if new.actor.is_none() && new.target.is_none() {
            return Err(AthanorError::Validation(
                "at least one of actor or target is required".into(),
            ));
        }
        if let Some(actor) = &new.actor {
            if actor.id.is_empty() {
                return Err(AthanorError::Validation("actor.id is required".into()));
            }
            check_len("actor.id", &actor.id, MAX_ID_LEN)?;
            check_opt_len("actor.name", actor.name.as_deref(), MAX_NAME_LEN)?;
        }
        if let Some(target) = &new.target {
            if target.id.is_empty() {
                return Err(AthanorError::Validation("target.id is required".into()));
            }
            check_len("target.id", &target.id, MAX_ID_LEN)?;
            check_opt_len("target.name", target.name.as_deref(), MAX_NAME_LEN)?;
        }
        check_opt_len("external_id", new.external_id.as_deref(), MAX_ID_LEN)?;
        check_opt_len(
            "description",
            new.description.as_deref(),
            MAX_DESCRIPTION_LEN,
        )?;
        Ok(())
    }

    /// Validate a bulk submission's size before touching the database.
    pub fn validate_bulk(&self, batch: &[NewEvent]) -> Result<()> {
        if batch.len() > self.config.max_bulk_events {
            return Err(AthanorError::BulkTooLarge {
                count: batch.len(),
                max: self.config.max_bulk_events,
            });
        }
        for new in batch {
            Self::validate(new)?;
        }
        Ok(())
    }

    /// Phase one: persist the submission with its assigned event id.
    pub fn accept(&self, stream: &StreamKey, new: NewEvent) -> Result<IngestTask> {
        Self::validate(&new)?;
        let task = IngestTask::accept(stream.clone(), Uuid::new_v4(), new);
        self.store
            .with_write(|conn| store::insert_ingest_task(conn, &task))?;
        tracing::debug!(stream = %stream, event = %task.new_event_id, "accepted submission");
        Ok(task)
    }

    /// Phase two: build the chain link and commit it.
    pub fn commit(&self, task: &IngestTask) -> Result<AuditEvent> {
        self.chain.append(
            &task.stream,
            task.original_event.clone(),
            task.new_event_id,
            Some(task.received),
            Some(task.id),
        )
    }

    /// Accept and commit a whole batch under one stream lock. All or
    /// nothing: a failure removes the staged tasks and surfaces the error.
    pub fn submit_bulk(&self, stream: &StreamKey, batch: Vec<NewEvent>) -> Result<Vec<AuditEvent>> {
        self.validate_bulk(&batch)?;

        let tasks: Vec<IngestTask> = batch
            .into_iter()
            .map(|new| IngestTask::accept(stream.clone(), Uuid::new_v4(), new))
            .collect();

        self.store.with_txn(|tx| {
            for task in &tasks {
                store::insert_ingest_task(tx, task)?;
            }
            Ok(())
        })?;

        match self.chain.append_batch(stream, &tasks) {
            Ok(events) => Ok(events),
            Err(err) => {
                let cleanup = self.store.with_txn(|tx| {
                    for task in &tasks {
                        store::delete_ingest_task(tx, task.id)?;
                    }
                    Ok(())
                });
                if let Err(cleanup_err) = cleanup {
                    tracing::error!(stream = %stream, error = %cleanup_err,
                        "failed to clear staged tasks after bulk rollback");
                }
                Err(err)
            }
        }
    }

    /// Move a failed accept to the backlog, respecting the per-stream cap.
    pub fn fail_to_backlog(&self, task: &IngestTask, error: &str) -> Result<i64> {
        let depth = self
            .store
            .with_write(|conn| store::backlog_depth(conn, &task.stream))?;
        if depth >= self.config.max_backlog_per_stream {
            return Err(AthanorError::BacklogFull {
                project_id: task.stream.project_id.clone(),
                environment_id: task.stream.environment_id.clone(),
                depth,
            });
        }

        let backlog_id = self
            .store
            .with_txn(|tx| store::move_to_backlog(tx, task, error))?;
        tracing::info!(
            stream = %task.stream,
            event = %task.new_event_id,
            backlog_id,
            error,
            "commit failed; event moved to backlog for retry"
        );
        Ok(backlog_id)
    }
}

fn check_len(field: &str, value: &str, max: usize) -> Result<()> {
    if value.len() > max {
        return Err(AthanorError::Validation(format!(
            "{field} exceeds {max} characters"
        )));
    }
    Ok(())
}

fn check_opt_len(field: &str, value: Option<&str>, max: usize) -> Result<()> {
    match value {
        Some(v) => check_len(field, v, max),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use athanor_core::{Actor, Crud, Target};

    #[test]
    fn validate_requires_action() {
        let mut new = NewEvent::new("", Crud::Create).with_actor(Actor::new("u1"));
        assert!(matches!(
            IngestPipeline::validate(&new),
            Err(AthanorError::Validation(_))
        ));

        new.action = "user.create".into();
        assert!(IngestPipeline::validate(&new).is_ok());
    }

    #[test]
    fn validate_requires_actor_or_target() {
        let bare = NewEvent::new("user.create", Crud::Create);
        assert!(IngestPipeline::validate(&bare).is_err());

        let with_target =
            NewEvent::new("user.create", Crud::Create).with_target(Target::new("u1"));
        assert!(IngestPipeline::validate(&with_target).is_ok());
    }

    #[test]
    fn validate_enforces_length_limits() {
        let long_action = "a".repeat(MAX_ACTION_LEN + 1);
        let new = NewEvent::new(long_action, Crud::Create).with_actor(Actor::new("u1"));
        assert!(IngestPipeline::validate(&new).is_err());

        let new = NewEvent::new("user.create", Crud::Create)
            .with_actor(Actor::new("u1"))
            .with_external_id("x".repeat(MAX_ID_LEN + 1));
        assert!(IngestPipeline::validate(&new).is_err());
    }

    #[test]
    fn validate_rejects_empty_actor_id() {
        let new = NewEvent::new("user.create", Crud::Create).with_actor(Actor::new(""));
        assert!(IngestPipeline::validate(&new).is_err());
    }
}
