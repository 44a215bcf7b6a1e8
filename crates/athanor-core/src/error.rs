use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AthanorError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("no project/environment context bound on this client")]
    ContextMissing,

    #[error("bulk submission of {count} events exceeds the configured limit of {max}")]
    BulkTooLarge { count: usize, max: usize },

    #[error("external_id '{0}' already exists in this stream")]
    DuplicateExternalId(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("chain conflict: {0}")]
    ChainConflict(String),

    #[error("backlog for stream {project_id}/{environment_id} is full ({depth} rows)")]
    BacklogFull {
        project_id: String,
        environment_id: String,
        depth: u64,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("integrity failure: {0}")]
    Integrity(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("stream lock timed out after {timeout_ms}ms (high contention on this stream)")]
    LockTimeout { timeout_ms: u64 },

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AthanorError>;

impl AthanorError {
    /// Wrap this error with additional context.
    ///
    /// The context string is prepended to the error message, producing a
    /// chain like `"during backlog replay: storage error: ..."`.
    pub fn context(self, msg: impl Into<String>) -> Self {
        let ctx = msg.into();
        AthanorError::Storage(format!("{}: {}", ctx, self))
    }

    /// Whether this error is worth retrying through the backlog.
    ///
    /// Validation and configuration faults are permanent; retrying them
    /// cannot succeed, so the ingest pipeline surfaces them without
    /// touching the backlog.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            AthanorError::Validation(_)
                | AthanorError::InvalidConfiguration(_)
                | AthanorError::BulkTooLarge { .. }
                | AthanorError::DuplicateExternalId(_)
                | AthanorError::ContextMissing
                | AthanorError::Crypto(_)
        )
    }
}

/// Extension trait to add `.context()` on `Result<T, AthanorError>`.
pub trait ResultExt<T> {
    /// If the result is `Err`, wrap the error with additional context.
    fn context(self, msg: impl Into<String>) -> Result<T>;

    /// If the result is `Err`, wrap the error with a lazily-evaluated context.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(msg))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.context(f()))
    }
}
