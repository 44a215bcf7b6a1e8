//! Backlog worker: background replay of failed commits.
//!
//! Each tick fetches the oldest live backlog rows grouped by stream and
//! replays one stream at a time in original accept order, holding that
//! stream's lock for each append (via the chain engine). A row that fails
//! replay blocks the rest of its stream for the tick — skipping ahead
//! would reorder the chain. Rows reaching the attempt cap are flagged
//! dead-letter and left on disk; they are never silently dropped.

use athanor_core::{BacklogConfig, BacklogRow, Result, StreamKey};
use athanor_sqlite::{store, SqliteEventStore};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::chain::ChainEngine;

/// Counters published by the worker.
#[derive(Default)]
pub struct BacklogMetrics {
    pub replayed: AtomicU64,
    pub failures: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub last_tick_unix: AtomicU64,
}

impl BacklogMetrics {
    pub fn snapshot(&self) -> BacklogMetricsSnapshot {
        BacklogMetricsSnapshot {
            replayed: self.replayed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            last_tick_unix: self.last_tick_unix.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BacklogMetricsSnapshot {
    pub replayed: u64,
    pub failures: u64,
    pub dead_lettered: u64,
    pub last_tick_unix: u64,
}

/// Outcome of one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickStats {
    pub replayed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub deferred: usize,
}

pub struct BacklogWorker {
    store: Arc<SqliteEventStore>,
    chain: Arc<ChainEngine>,
    config: BacklogConfig,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<BacklogMetrics>,
}

impl BacklogWorker {
    pub fn new(
        store: Arc<SqliteEventStore>,
        chain: Arc<ChainEngine>,
        config: BacklogConfig,
    ) -> Self {
        Self {
            store,
            chain,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(BacklogMetrics::default()),
        }
    }

    pub fn metrics(&self) -> &Arc<BacklogMetrics> {
        &self.metrics
    }

    /// Signal the run loop to stop after the current tick.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Run ticks until shutdown. Per-row errors are logged and retried on
    /// later ticks; only the loop plumbing itself can end this task.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            tick_interval_ms = self.config.tick_interval_ms,
            batch_size = self.config.batch_size,
            "backlog worker started"
        );

        while !self.shutdown.load(Ordering::Relaxed) {
            let worker = self.clone();
            match tokio::task::spawn_blocking(move || worker.run_tick()).await {
                Ok(Ok(stats)) => {
                    if stats != TickStats::default() {
                        tracing::debug!(
                            replayed = stats.replayed,
                            failed = stats.failed,
                            dead_lettered = stats.dead_lettered,
                            deferred = stats.deferred,
                            "backlog tick"
                        );
                    }
                }
                Ok(Err(e)) => tracing::error!(error = %e, "backlog tick failed"),
                Err(e) => tracing::error!(error = %e, "backlog tick panicked"),
            }

            self.metrics
                .last_tick_unix
                .store(Utc::now().timestamp() as u64, Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(self.config.tick_interval_ms)).await;
        }

        tracing::info!("backlog worker stopped");
    }

    /// One synchronous drain pass. Public so tests and embedders can drive
    /// the worker without the loop.
    pub fn run_tick(&self) -> Result<TickStats> {
        let batch = self
            .store
            .with_write(|conn| store::fetch_backlog_batch(conn, self.config.batch_size))?;

        let mut groups: BTreeMap<StreamKey, Vec<BacklogRow>> = BTreeMap::new();
        for row in batch {
            groups.entry(row.stream.clone()).or_default().push(row);
        }

        let mut stats = TickStats::default();
        let now = Utc::now();

        for (stream, rows) in groups {
            let mut remaining = rows.len();
            for row in rows {
                remaining -= 1;
                if !self.eligible(&row, now) {
                    // Later rows of this stream must wait too; replaying
                    // past a deferred row would reorder the chain.
                    stats.deferred += remaining + 1;
                    break;
                }
                if !self.replay_row(&stream, row, &mut stats)? {
                    stats.deferred += remaining;
                    break;
                }
            }
        }

        Ok(stats)
    }

    /// Replay one row. Returns `false` when the rest of the stream's rows
    /// should be left for a later tick.
    fn replay_row(&self, stream: &StreamKey, row: BacklogRow, stats: &mut TickStats) -> Result<bool> {
        // A commit that timed out at the caller may still have landed;
        // the reserved event id makes that detectable.
        let committed = self
            .store
            .with_write(|conn| store::get_event(conn, stream, row.new_event_id))?;
        if committed.is_some() {
            self.store
                .with_write(|conn| store::mark_backlog_processed(conn, row.id))?;
            self.metrics.replayed.fetch_add(1, Ordering::Relaxed);
            stats.replayed += 1;
            tracing::debug!(
                stream = %stream,
                event = %row.new_event_id,
                "backlog row already committed; marked processed"
            );
            return Ok(true);
        }

        match self.chain.append(
            stream,
            row.original_event.clone(),
            row.new_event_id,
            Some(row.received),
            None,
        ) {
            Ok(_) => {
                self.store
                    .with_write(|conn| store::mark_backlog_processed(conn, row.id))?;
                self.metrics.replayed.fetch_add(1, Ordering::Relaxed);
                stats.replayed += 1;
                tracing::info!(
                    stream = %stream,
                    event = %row.new_event_id,
                    attempts = row.attempts,
                    "replayed backlog event"
                );
                Ok(true)
            }
            Err(err) => {
                let attempts = self
                    .store
                    .with_write(|conn| store::bump_attempts(conn, row.id, &err.to_string()))?;
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                stats.failed += 1;

                let permanent = !err.is_transient();
                if permanent || attempts >= self.config.max_attempts {
                    self.store
                        .with_write(|conn| store::mark_backlog_dead(conn, row.id))?;
                    self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    stats.dead_lettered += 1;
                    tracing::error!(
                        stream = %stream,
                        event = %row.new_event_id,
                        attempts,
                        error = %err,
                        "backlog row dead-lettered"
                    );
                } else {
                    tracing::warn!(
                        stream = %stream,
                        event = %row.new_event_id,
                        attempts,
                        max_attempts = self.config.max_attempts,
                        error = %err,
                        "backlog replay failed; will retry"
                    );
                }
                Ok(false)
            }
        }
    }

    fn eligible(&self, row: &BacklogRow, now: DateTime<Utc>) -> bool {
        if row.attempts == 0 {
            return true;
        }
        let Some(last_attempt) = row.last_attempt else {
            return true;
        };
        let delay = self.backoff_delay(row.attempts);
        let elapsed = now.signed_duration_since(last_attempt);
        elapsed.num_milliseconds().max(0) as u128 >= delay.as_millis()
    }

    /// Exponential backoff keyed off the attempt count: base * 2^(n-1),
    /// capped.
    fn backoff_delay(&self, attempts: u32) -> Duration {
        let base = Duration::from_millis(self.config.backoff_base_ms);
        let cap = Duration::from_millis(self.config.backoff_cap_ms);
        let multiplier = 2u32.saturating_pow(attempts.saturating_sub(1));
        base.saturating_mul(multiplier).min(cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use athanor_core::{CryptoConfig, CryptoService, StoreConfig, StreamLocks};
    use tempfile::TempDir;

    fn test_worker(config: BacklogConfig) -> (BacklogWorker, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            SqliteEventStore::open(&StoreConfig::new(dir.path().join("audit.db")).with_pool_size(1))
                .unwrap(),
        );
        let crypto = Arc::new(
            CryptoService::from_config(&CryptoConfig::new(
                include_str!("../tests/fixtures/signing_key.pem"),
                include_str!("../tests/fixtures/signing_key.pub.pem"),
            ))
            .unwrap(),
        );
        let locks = Arc::new(StreamLocks::with_stripes(16));
        let chain = Arc::new(ChainEngine::new(store.clone(), crypto, locks));
        (BacklogWorker::new(store, chain, config), dir)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = BacklogConfig {
            backoff_base_ms: 1000,
            backoff_cap_ms: 300_000,
            ..Default::default()
        };
        let (worker, _dir) = test_worker(config);

        assert_eq!(worker.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(worker.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(worker.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(worker.backoff_delay(5), Duration::from_secs(16));
        assert_eq!(worker.backoff_delay(30), Duration::from_secs(300));
    }

    #[test]
    fn fresh_rows_are_eligible_and_recent_failures_wait() {
        let (worker, _dir) = test_worker(BacklogConfig::default());
        let now = Utc::now();

        let mut row = BacklogRow {
            id: 1,
            stream: StreamKey::new("p", "e"),
            new_event_id: uuid::Uuid::new_v4(),
            received: now,
            original_event: athanor_core::NewEvent::new("a.b", athanor_core::Crud::Create),
            attempts: 0,
            last_attempt: None,
            last_error: None,
        };
        assert!(worker.eligible(&row, now));

        row.attempts = 3;
        row.last_attempt = Some(now - chrono::Duration::milliseconds(100));
        assert!(!worker.eligible(&row, now));

        row.last_attempt = Some(now - chrono::Duration::seconds(10));
        assert!(worker.eligible(&row, now));
    }

    #[test]
    fn run_tick_is_a_no_op_on_empty_backlog() {
        let (worker, _dir) = test_worker(BacklogConfig::default());
        assert_eq!(worker.run_tick().unwrap(), TickStats::default());
    }
}
