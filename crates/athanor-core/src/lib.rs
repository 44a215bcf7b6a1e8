//! Athanor Core: types and primitives for the athanor audit store
//!
//! This crate defines the building blocks of a tamper-evident,
//! append-only audit-event store:
//! - Event model: submissions, committed events, streams, backlog rows
//! - Canonicalizer: deterministic byte form of an event's signable fields
//! - Crypto service: digest, private-key signing, public-key verification
//! - Stream locks: per-(project, environment) append serialization
//! - Configuration: explicit records with documented defaults
//!
//! Key properties:
//! - Each stream's chain has exactly one linear history; every non-genesis
//!   event links to its predecessor via `previous_hash`
//! - Canonical bytes are independent of map iteration order, so digests
//!   and signatures recompute identically on any host
//! - Committed events are immutable; sealing adds markers, never rewrites

pub mod canonical;
pub mod config;
pub mod crypto;
pub mod error;
pub mod stream_locks;
pub mod types;

pub use canonical::canonical_event_bytes;
pub use config::{
    AuditConfig, BacklogConfig, ContextConfig, CryptoConfig, IngestConfig, IntegrityConfig,
    StoreConfig, SynchronousMode,
};
pub use crypto::{CryptoService, HashAlgorithm, SigningAlgorithm};
pub use error::{AthanorError, Result, ResultExt};
pub use stream_locks::{StreamGuard, StreamLocks};
pub use types::{
    Actor, AuditEvent, BacklogRow, ChainTip, Crud, Cursor, EventFilter, EventPage, FailureReason,
    Group, IngestTask, NewEvent, SealMarker, StreamKey, Target, ValidationFailure,
    ValidationReport,
};
