//! Error types for idsync-engine.

use std::path::PathBuf;

/// Main error type for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// State store error.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Provider registry error.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The bucket has never been written.
    #[error("bucket not found: {bucket}")]
    BucketNotFound {
        /// The missing bucket.
        bucket: String,
    },

    /// The bucket exists but holds no value under the key.
    #[error("key not found in bucket {bucket}")]
    KeyNotFound {
        /// The bucket that was searched.
        bucket: String,
    },

    /// Write attempted through a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnly,

    /// Operation attempted on a committed or rolled back transaction.
    #[error("transaction is closed")]
    Closed,

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Value could not be encoded or decoded as JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

impl StoreError {
    /// True for the "no prior value" errors, which callers treat as absence.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::BucketNotFound { .. } | Self::KeyNotFound { .. })
    }
}

/// State store errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A persisted record could not be decoded.
    #[error("corrupt record in bucket {bucket}: {source}")]
    Corrupt {
        /// Bucket holding the record.
        bucket: String,
        /// Decode failure.
        source: serde_json::Error,
    },

    /// Writing back state failed; the transaction was rolled back.
    #[error("{}", joined(.source, .rollback))]
    Commit {
        /// The write or commit failure.
        source: StoreError,
        /// Failure of the follow-up rollback, if any.
        rollback: Option<StoreError>,
    },
}

fn joined(source: &StoreError, rollback: &Option<StoreError>) -> String {
    match rollback {
        Some(rb) => format!("commit failed: {source}; rollback failed: {rb}"),
        None => format!("commit failed: {source}"),
    }
}

/// Errors reported by providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The source could not be queried.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Provider configuration was rejected.
    #[error("invalid provider configuration: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Source data could not be decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Waiting for the rate limiter failed.
    #[error("rate limiter: {0}")]
    RateLimit(#[from] crate::ratelimit::RateLimitError),
}

impl ProviderError {
    /// True if the fetch stopped because shutdown was requested.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::RateLimit(crate::ratelimit::RateLimitError::Cancelled)
        )
    }
}

/// Errors raised handing events to the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The pipeline no longer accepts events.
    #[error("pipeline closed")]
    Closed,

    /// Event could not be serialized.
    #[error("event serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error writing the event.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Provider registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A factory is already registered under this name.
    #[error("provider already registered: {0}")]
    Duplicate(String),

    /// No factory is registered under this name.
    #[error("unknown provider: {0}")]
    NotFound(String),

    /// The factory failed to build the provider.
    #[error("failed to build provider {name}: {source}")]
    Build {
        /// Provider name.
        name: String,
        /// Factory failure.
        source: ProviderError,
    },
}

/// Failure of a single synchronization cycle.
///
/// A cycle failure is logged and counted; the scheduler carries on with the
/// next tick.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    /// State could not be loaded or committed.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// The provider fetch failed.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// An event could not be handed to the pipeline.
    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    /// Shutdown was requested while the cycle was running.
    #[error("cycle cancelled")]
    Cancelled,

    /// The cycle panicked.
    #[error("cycle panicked: {message}\n{backtrace}")]
    Panic {
        /// Panic payload, if it was a string.
        message: String,
        /// Backtrace captured at the panic site.
        backtrace: String,
    },
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Result type alias for storage operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
