//! Convenience re-exports for the common path.
//!
//! ```no_run
//! use athanor::prelude::*;
//! ```

pub use crate::client::AuditClient;
pub use athanor_core::{
    Actor, AthanorError, AuditConfig, AuditEvent, Crud, EventFilter, EventPage, Group, NewEvent,
    Result, SealMarker, StreamKey, Target, ValidationReport,
};
