//! Athanor: an append-only, tamper-evident audit-event store
//!
//! Every (project, environment) stream carries a hash chain of signed
//! events: each committed event links to its predecessor via
//! `previous_hash`, is digested over a canonical byte form, and is signed
//! with the service's private key. Later insertion, reordering, or
//! mutation of history is detectable by re-derivation.
//!
//! The crate provides:
//! - **Chain engine**: per-stream serialized appends with one linear
//!   history per stream, parallel across streams
//! - **Ingest pipeline**: durable accept, then bounded commit; failed
//!   commits land in a persistent backlog
//! - **Backlog worker**: background replay with bounded attempts and
//!   dead-lettering
//! - **Verifier & sealer**: range integrity reports, seal markers, and
//!   WORM export
//!
//! # Quick Start
//!
//! ```no_run
//! use athanor::prelude::*;
//! use std::path::PathBuf;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let config = AuditConfig::new(
//!     PathBuf::from("./audit.db"),
//!     std::fs::read_to_string("private.pem")?,
//!     std::fs::read_to_string("public.pem")?,
//! );
//! let client = AuditClient::open(config).await?;
//!
//! let stream = StreamKey::new("project-1", "production");
//! let event = client
//!     .create_event(
//!         &stream,
//!         NewEvent::new("user.create", Crud::Create).with_actor(Actor::new("u1")),
//!     )
//!     .await?;
//! assert!(event.previous_hash.is_none()); // genesis
//!
//! let report = client
//!     .validate_events(&stream, chrono::DateTime::UNIX_EPOCH, chrono::Utc::now())
//!     .await?;
//! assert!(report.is_clean());
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod backlog;
pub mod chain;
pub mod client;
pub mod ingest;
pub mod prelude;
pub mod seal;
pub mod verify;
pub mod worm;

// Re-export core types
pub use athanor_core::{
    canonical_event_bytes, Actor, AthanorError, AuditConfig, AuditEvent, BacklogConfig,
    BacklogRow, ChainTip, ContextConfig, Crud, CryptoConfig, CryptoService, Cursor, EventFilter,
    EventPage, FailureReason, Group, HashAlgorithm, IngestConfig, IngestTask, IntegrityConfig,
    NewEvent, Result, SealMarker, SigningAlgorithm, StoreConfig, StreamKey, StreamLocks,
    SynchronousMode, Target, ValidationFailure, ValidationReport,
};

// Re-export the storage backend
pub use athanor_sqlite::{ReadGuard, SqliteEventStore};

// Re-export main types from this crate
pub use backlog::{BacklogMetrics, BacklogMetricsSnapshot, BacklogWorker, TickStats};
pub use chain::ChainEngine;
pub use client::AuditClient;
pub use ingest::IngestPipeline;
pub use seal::Sealer;
pub use verify::Verifier;
pub use worm::{WormExporter, WormRecord};
