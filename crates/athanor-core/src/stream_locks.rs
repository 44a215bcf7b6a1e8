//! Per-stream serialization.
//!
//! The chain engine must let at most one append per stream proceed at a
//! time while appends to different streams run in parallel. Stream keys
//! are hashed to a fixed set of stripes; the stripe mutex is the stream's
//! advisory lock. Acquisition uses `try_lock_for` with a timeout so a hot
//! stream degrades into a lock-timeout error instead of unbounded queueing.

use crate::error::{AthanorError, Result};
use crate::types::StreamKey;
use parking_lot::{Mutex, MutexGuard};
use std::time::Duration;
use xxhash_rust::xxh3::xxh3_64;

/// Default stream lock acquisition timeout (5 seconds)
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5000;

/// Stripe-locked mutex table keyed by the stream key.
///
/// Two distinct streams may occasionally share a stripe; that costs
/// parallelism, never correctness. More stripes = less false sharing.
pub struct StreamLocks {
    stripes: Vec<Mutex<()>>,
    num_stripes: usize,
    default_timeout: Duration,
}

/// Guard holding one stream's lock; released on drop.
pub struct StreamGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl StreamLocks {
    /// Create a lock table with `num_stripes` stripes.
    ///
    /// # Panics
    ///
    /// Panics if `num_stripes` is 0.
    pub fn new(num_stripes: usize, default_timeout: Duration) -> Self {
        assert!(num_stripes > 0, "num_stripes must be positive");
        let stripes = (0..num_stripes).map(|_| Mutex::new(())).collect();

        Self {
            stripes,
            num_stripes,
            default_timeout,
        }
    }

    /// Create a lock table with the default timeout.
    pub fn with_stripes(num_stripes: usize) -> Self {
        Self::new(num_stripes, Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS))
    }

    fn stripe_index(&self, stream: &StreamKey) -> usize {
        let hash = xxh3_64(&stream.lock_key());
        (hash as usize) % self.num_stripes
    }

    /// Take the exclusive lock for `stream`, waiting up to the default
    /// timeout.
    pub fn lock(&self, stream: &StreamKey) -> Result<StreamGuard<'_>> {
        self.lock_with_timeout(stream, self.default_timeout)
    }

    /// Take the exclusive lock for `stream` with a custom timeout.
    pub fn lock_with_timeout(
        &self,
        stream: &StreamKey,
        timeout: Duration,
    ) -> Result<StreamGuard<'_>> {
        let idx = self.stripe_index(stream);
        match self.stripes[idx].try_lock_for(timeout) {
            Some(guard) => Ok(StreamGuard { _guard: guard }),
            None => Err(AthanorError::LockTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    pub fn num_stripes(&self) -> usize {
        self.num_stripes
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}
