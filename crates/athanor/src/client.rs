//! The audit client: the library surface a front-end calls.
//!
//! Owns the store, crypto service, stream locks, and background workers.
//! Public operations are async; database and signing work runs on
//! blocking threads, and every commit is bounded by the configured
//! deadline. A commit that fails or times out leaves a backlog row and
//! surfaces the error — the assigned event id may still appear as
//! committed once the worker drains it, so strict callers can poll
//! `get_event`.

use athanor_core::{
    AthanorError, AuditConfig, AuditEvent, CryptoService, EventFilter, EventPage, IngestTask,
    NewEvent, Result, SealMarker, StreamKey, StreamLocks, ValidationReport,
};
use athanor_sqlite::{store, SqliteEventStore};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backlog::BacklogWorker;
use crate::chain::ChainEngine;
use crate::ingest::IngestPipeline;
use crate::seal::Sealer;
use crate::verify::Verifier;
use crate::worm::WormExporter;

struct WorkerHandle {
    worker: Arc<BacklogWorker>,
    handle: JoinHandle<()>,
}

pub struct AuditClient {
    config: AuditConfig,
    store: Arc<SqliteEventStore>,
    pipeline: Arc<IngestPipeline>,
    verifier: Verifier,
    sealer: Sealer,
    worm: Option<WormExporter>,
    context: RwLock<Option<StreamKey>>,
    worker: Mutex<Option<WorkerHandle>>,
    validation_task: Mutex<Option<JoinHandle<()>>>,
}

impl AuditClient {
    /// Validate the configuration, open the store, and start the
    /// configured background services. Must run inside a tokio runtime.
    pub async fn open(config: AuditConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let crypto = Arc::new(CryptoService::from_config(&config.crypto)?);
        let store_config = config.store.clone();
        let store = tokio::task::spawn_blocking(move || SqliteEventStore::open(&store_config))
            .await
            .map_err(|e| AthanorError::Storage(format!("store open task failed: {e}")))??;
        let store = Arc::new(store);

        let locks = Arc::new(StreamLocks::new(
            config.store.stripe_count,
            Duration::from_millis(config.store.lock_timeout_ms),
        ));
        let chain = Arc::new(ChainEngine::new(store.clone(), crypto.clone(), locks));
        let pipeline = Arc::new(IngestPipeline::new(
            store.clone(),
            chain.clone(),
            config.ingest.clone(),
        ));
        let verifier = Verifier::new(crypto);
        let sealer = Sealer::new(store.clone(), config.integrity.clone());
        let worm = config
            .integrity
            .worm_enabled
            .then(|| {
                config
                    .integrity
                    .worm_storage_path
                    .clone()
                    .map(WormExporter::new)
            })
            .flatten();

        let context = match (&config.context.project_id, &config.context.environment_id) {
            (Some(project), Some(environment)) => Some(StreamKey::new(project, environment)),
            _ => None,
        };

        let client = Arc::new(Self {
            store: store.clone(),
            pipeline,
            verifier,
            sealer,
            worm,
            context: RwLock::new(context),
            worker: Mutex::new(None),
            validation_task: Mutex::new(None),
            config,
        });

        if client.config.backlog.enabled {
            let worker = Arc::new(BacklogWorker::new(
                store,
                chain,
                client.config.backlog.clone(),
            ));
            let handle = tokio::spawn(worker.clone().run());
            *client.worker.lock() = Some(WorkerHandle { worker, handle });
        }

        if let Some(interval_s) = client.config.integrity.scheduled_validation_interval_s {
            let handle = spawn_validation_sweep(&client, Duration::from_secs(interval_s));
            *client.validation_task.lock() = Some(handle);
        }

        tracing::info!(path = %client.store.path().display(), "audit client opened");
        Ok(client)
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Bind default project/environment for `*_with_context` calls.
    pub fn set_context(
        &self,
        project_id: impl Into<String>,
        environment_id: impl Into<String>,
    ) {
        *self.context.write() = Some(StreamKey::new(project_id, environment_id));
    }

    fn context(&self) -> Result<StreamKey> {
        self.context
            .read()
            .clone()
            .ok_or(AthanorError::ContextMissing)
    }

    /// Submit one event: durable accept, then chain commit bounded by the
    /// configured deadline. Returns the committed event or an error; on a
    /// transient failure the event is parked in the backlog first.
    pub async fn create_event(&self, stream: &StreamKey, new: NewEvent) -> Result<AuditEvent> {
        IngestPipeline::validate(&new)?;

        let pipeline = self.pipeline.clone();
        let accept_stream = stream.clone();
        let task = tokio::task::spawn_blocking(move || pipeline.accept(&accept_stream, new))
            .await
            .map_err(|e| AthanorError::Storage(format!("accept task failed: {e}")))??;

        let deadline = Duration::from_millis(self.config.ingest.create_event_timeout_ms);
        let pipeline = self.pipeline.clone();
        let commit_task = task.clone();
        let commit = tokio::task::spawn_blocking(move || pipeline.commit(&commit_task));

        match tokio::time::timeout(deadline, commit).await {
            Ok(Ok(Ok(event))) => Ok(event),
            Ok(Ok(Err(err))) => Err(self.park_failed_commit(task, err).await),
            Ok(Err(join_err)) => {
                let err = AthanorError::Storage(format!("commit task failed: {join_err}"));
                Err(self.park_failed_commit(task, err).await)
            }
            Err(_) => {
                let err = AthanorError::Timeout(format!(
                    "create_event exceeded {}ms for event {}",
                    self.config.ingest.create_event_timeout_ms, task.new_event_id
                ));
                Err(self.park_failed_commit(task, err).await)
            }
        }
    }

    /// Submit a batch into one stream. The whole batch commits under one
    /// stream lock or none of it commits; on failure the caller resubmits.
    pub async fn create_events(
        &self,
        stream: &StreamKey,
        batch: Vec<NewEvent>,
    ) -> Result<Vec<AuditEvent>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        self.pipeline.validate_bulk(&batch)?;

        let deadline = Duration::from_millis(self.config.ingest.create_event_timeout_ms);
        let pipeline = self.pipeline.clone();
        let bulk_stream = stream.clone();
        let submit = tokio::task::spawn_blocking(move || pipeline.submit_bulk(&bulk_stream, batch));

        match tokio::time::timeout(deadline, submit).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(AthanorError::Storage(format!(
                "bulk commit task failed: {join_err}"
            ))),
            Err(_) => Err(AthanorError::Timeout(format!(
                "create_events exceeded {}ms",
                self.config.ingest.create_event_timeout_ms
            ))),
        }
    }

    /// Scoped lookup of a committed event.
    pub async fn get_event(&self, stream: &StreamKey, id: Uuid) -> Result<AuditEvent> {
        let conn = self.store.reader().await?;
        store::get_event(&conn, stream, id)?
            .ok_or_else(|| AthanorError::NotFound(format!("event {id} in stream {stream}")))
    }

    /// Keyset-paginated query over one stream.
    pub async fn query_events(
        &self,
        stream: &StreamKey,
        filter: EventFilter,
    ) -> Result<EventPage> {
        let (events, next_cursor, total) = {
            let conn = self.store.reader().await?;
            let (events, next) = store::query_events(&conn, stream, &filter)?;
            let total = if filter.with_total {
                Some(store::count_events(&conn, stream, &filter)?)
            } else {
                None
            };
            (events, next, total)
        };

        if self.config.integrity.validate_on_query {
            let report = self.verifier.verify_digests(&events);
            if !report.is_clean() {
                return Err(AthanorError::Integrity(format!(
                    "{} of {} returned events failed digest verification",
                    report.failed.len(),
                    report.total
                )));
            }
        }

        Ok(EventPage {
            events,
            next_cursor: next_cursor.map(|c| c.encode()),
            total,
        })
    }

    /// Re-derive digests, signatures, and chain links over a time range.
    /// Per-event failures are reported in the result, never thrown.
    pub async fn validate_events(
        &self,
        stream: &StreamKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ValidationReport> {
        let store = self.store.clone();
        let verifier = self.verifier.clone();
        let stream = stream.clone();
        tokio::task::spawn_blocking(move || {
            let conn = store.open_read_connection()?;
            let events = store::events_in_range(&conn, &stream, start, end)?;
            Ok(verifier.verify_events(&events))
        })
        .await
        .map_err(|e| AthanorError::Storage(format!("validation task failed: {e}")))?
    }

    /// Seal the stream up to `up_to` and return the marker.
    pub async fn seal_events(
        &self,
        stream: &StreamKey,
        up_to: DateTime<Utc>,
    ) -> Result<SealMarker> {
        let sealer = self.sealer.clone();
        let stream = stream.clone();
        tokio::task::spawn_blocking(move || sealer.seal(&stream, up_to))
            .await
            .map_err(|e| AthanorError::Storage(format!("seal task failed: {e}")))?
    }

    /// Seal whatever prefix of the stream has aged past
    /// `seal_after_days`, aligned to whole partition windows. Returns
    /// `None` when the latest seal already covers it.
    pub async fn seal_due(&self, stream: &StreamKey) -> Result<Option<SealMarker>> {
        let sealer = self.sealer.clone();
        let stream = stream.clone();
        tokio::task::spawn_blocking(move || sealer.seal_due(&stream))
            .await
            .map_err(|e| AthanorError::Storage(format!("seal task failed: {e}")))?
    }

    /// Export a range to WORM storage; returns the exported event count.
    /// Idempotent per (stream, range).
    pub async fn export_to_worm(
        &self,
        stream: &StreamKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let exporter = self.worm.clone().ok_or_else(|| {
            AthanorError::InvalidConfiguration("WORM export is not enabled".into())
        })?;

        let store = self.store.clone();
        let stream = stream.clone();
        tokio::task::spawn_blocking(move || {
            let conn = store.open_read_connection()?;
            // The covering marker is the earliest seal that reaches the
            // end of the range, if one exists yet.
            let covering = store::list_seal_markers(&conn, &stream)?
                .into_iter()
                .find(|marker| marker.up_to_time >= end);
            exporter
                .export(&conn, &stream, start, end, covering.as_ref())
                .map(|(count, _path)| count)
        })
        .await
        .map_err(|e| AthanorError::Storage(format!("export task failed: {e}")))?
    }

    // Context-default conveniences. The core operations above take the
    // stream positionally; these resolve the bound default instead.

    pub async fn create_event_with_context(&self, new: NewEvent) -> Result<AuditEvent> {
        let stream = self.context()?;
        self.create_event(&stream, new).await
    }

    pub async fn create_events_with_context(
        &self,
        batch: Vec<NewEvent>,
    ) -> Result<Vec<AuditEvent>> {
        let stream = self.context()?;
        self.create_events(&stream, batch).await
    }

    pub async fn get_event_with_context(&self, id: Uuid) -> Result<AuditEvent> {
        let stream = self.context()?;
        self.get_event(&stream, id).await
    }

    pub async fn query_events_with_context(&self, filter: EventFilter) -> Result<EventPage> {
        let stream = self.context()?;
        self.query_events(&stream, filter).await
    }

    /// Drain background services and release the client.
    pub async fn close(&self) -> Result<()> {
        if let Some(handle) = self.validation_task.lock().take() {
            handle.abort();
        }

        let worker = self.worker.lock().take();
        if let Some(WorkerHandle { worker, handle }) = worker {
            worker.shutdown();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "backlog worker did not stop cleanly");
            }
        }

        tracing::info!("audit client closed");
        Ok(())
    }

    /// Park a transiently failed commit in the backlog; permanent errors
    /// surface untouched. Returns the error the caller should see.
    async fn park_failed_commit(&self, task: IngestTask, err: AthanorError) -> AthanorError {
        if !err.is_transient() {
            return err;
        }

        let pipeline = self.pipeline.clone();
        let message = err.to_string();
        match tokio::task::spawn_blocking(move || pipeline.fail_to_backlog(&task, &message)).await {
            Ok(Ok(_)) => err,
            Ok(Err(full @ AthanorError::BacklogFull { .. })) => full,
            Ok(Err(other)) => {
                tracing::error!(error = %other, "failed to move event to backlog");
                err
            }
            Err(join_err) => {
                tracing::error!(error = %join_err, "backlog move task failed");
                err
            }
        }
    }
}

/// Periodic full-stream validation sweep. Holds only a weak reference so
/// a dropped client ends the task even without `close()`.
fn spawn_validation_sweep(client: &Arc<AuditClient>, interval: Duration) -> JoinHandle<()> {
    let weak = Arc::downgrade(client);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(client) = weak.upgrade() else { break };

            let store = client.store.clone();
            let verifier = client.verifier.clone();
            let swept = tokio::task::spawn_blocking(
                move || -> Result<Vec<(StreamKey, ValidationReport)>> {
                    let conn = store.open_read_connection()?;
                    let mut reports = Vec::new();
                    for stream in store::list_streams(&conn)? {
                        let events = store::events_in_range(
                            &conn,
                            &stream,
                            DateTime::UNIX_EPOCH,
                            Utc::now() + chrono::Duration::days(1),
                        )?;
                        reports.push((stream, verifier.verify_events(&events)));
                    }
                    Ok(reports)
                },
            )
            .await;

            match swept {
                Ok(Ok(reports)) => {
                    for (stream, report) in reports {
                        if report.is_clean() {
                            tracing::debug!(
                                stream = %stream,
                                total = report.total,
                                "scheduled validation clean"
                            );
                        } else {
                            tracing::warn!(
                                stream = %stream,
                                total = report.total,
                                failed = report.failed.len(),
                                "scheduled validation found integrity failures"
                            );
                        }
                    }
                }
                Ok(Err(e)) => tracing::error!(error = %e, "scheduled validation failed"),
                Err(e) => tracing::error!(error = %e, "scheduled validation task failed"),
            }
        }
    })
}
