//! SQLite backend for the athanor audit store.
//!
//! Layout:
//! - One write connection behind a mutex; the chain engine runs its
//!   serialized appends here inside immediate transactions
//! - A capped set of read-only connections, opened lazily and recycled
//!   through an idle stack, for queries and verification scans
//! - Schema-level immutability: committed events reject UPDATE outright
//!   and reject DELETE at or under the stream's latest seal marker

pub mod schema;
pub mod store;

pub use store::{ReadGuard, SqliteEventStore};
