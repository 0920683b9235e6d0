//! Error types for the mapper engine.
//!
//! Errors split into two families that drive task-queue behaviour:
//!
//! - **Transient** ([`Error::is_transient`]): infrastructure hiccups, write
//!   contention, transient mapper failures. Handlers return these so the queue
//!   redelivers the task.
//! - **Everything else**: not-found, stale deliveries, invalid configuration,
//!   programmer errors. Redelivery would not help, so the worker logs them and
//!   acknowledges the task.

use shardmap_core::{JobId, MapperId, ShardId};

/// The result type used throughout shardmap-mapper.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mapper orchestration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested job does not exist.
    #[error("no such job: {job_id}")]
    NoSuchJob {
        /// The job that was looked up.
        job_id: JobId,
    },

    /// The requested shard does not exist.
    #[error("shard not found: {shard_id}")]
    ShardNotFound {
        /// The shard that was looked up.
        shard_id: ShardId,
    },

    /// A process task was delivered after the shard had already moved past it.
    #[error("stale task for shard {shard_id}: task number {task_num}, shard is at {current}")]
    StaleTask {
        /// The shard the task targets.
        shard_id: ShardId,
        /// Task number carried by the delivery.
        task_num: u32,
        /// Task number persisted on the shard.
        current: u32,
    },

    /// A process task arrived before the shard recorded its task number.
    #[error("task for shard {shard_id} is ahead of the record: task number {task_num}, shard is at {current}")]
    TaskAhead {
        /// The shard the task targets.
        shard_id: ShardId,
        /// Task number carried by the delivery.
        task_num: u32,
        /// Task number persisted on the shard.
        current: u32,
    },

    /// No factory is registered under the mapper ID.
    #[error("unknown mapper: {mapper_id}")]
    UnknownMapper {
        /// The unregistered ID.
        mapper_id: MapperId,
    },

    /// A factory is already registered under the mapper ID.
    #[error("mapper already registered: {mapper_id}")]
    DuplicateMapper {
        /// The conflicting ID.
        mapper_id: MapperId,
    },

    /// The job configuration was rejected.
    #[error("invalid job config: {message}")]
    InvalidConfig {
        /// Why the configuration is invalid.
        message: String,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A retry-safe failure; the task should be redelivered.
    #[error("transient error: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A storage operation failed permanently.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from shardmap-core.
    #[error("core error: {0}")]
    Core(#[from] shardmap_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new transient error with a source.
    #[must_use]
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new invalid configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Returns true if redelivering the task may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::TaskAhead { .. })
    }
}
