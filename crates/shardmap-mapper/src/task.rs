//! Task payloads exchanged through the queue.
//!
//! Every step of a job runs as a [`MapperTask`] delivered at least once. Tasks
//! carry only identifiers; handlers reload state from the store, so a task can
//! be redelivered or arrive late without corrupting anything.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shardmap_core::{JobId, ShardId};

/// One unit of work for the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MapperTask {
    /// Split the job's query and create its shards.
    SplitAndLaunch {
        /// Target job.
        job_id: JobId,
    },
    /// Enqueue the first process task of every new shard.
    FanOutShards {
        /// Target job.
        job_id: JobId,
    },
    /// Map a bounded number of pages of one shard.
    ProcessShard {
        /// Target shard; carries the job ID.
        shard_id: ShardId,
        /// Sequence number this delivery expects on the shard.
        task_num: u32,
    },
    /// Aggregate shard states into the job state.
    UpdateJobState {
        /// Target job.
        job_id: JobId,
    },
}

/// Discriminant of [`MapperTask`], used to route deliveries to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    /// [`MapperTask::SplitAndLaunch`].
    SplitAndLaunch,
    /// [`MapperTask::FanOutShards`].
    FanOutShards,
    /// [`MapperTask::ProcessShard`].
    ProcessShard,
    /// [`MapperTask::UpdateJobState`].
    UpdateJobState,
}

impl TaskKind {
    /// All task kinds, in pipeline order.
    pub const ALL: [Self; 4] = [
        Self::SplitAndLaunch,
        Self::FanOutShards,
        Self::ProcessShard,
        Self::UpdateJobState,
    ];

    /// Snake-case label used in logs and metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::SplitAndLaunch => "split_and_launch",
            Self::FanOutShards => "fan_out_shards",
            Self::ProcessShard => "process_shard",
            Self::UpdateJobState => "update_job_state",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl MapperTask {
    /// Returns the task's kind.
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        match self {
            Self::SplitAndLaunch { .. } => TaskKind::SplitAndLaunch,
            Self::FanOutShards { .. } => TaskKind::FanOutShards,
            Self::ProcessShard { .. } => TaskKind::ProcessShard,
            Self::UpdateJobState { .. } => TaskKind::UpdateJobState,
        }
    }

    /// Returns the job the task belongs to.
    #[must_use]
    pub const fn job_id(&self) -> JobId {
        match self {
            Self::SplitAndLaunch { job_id }
            | Self::FanOutShards { job_id }
            | Self::UpdateJobState { job_id } => *job_id,
            Self::ProcessShard { shard_id, .. } => shard_id.job_id,
        }
    }

    /// Deterministic task name.
    ///
    /// Queues coalesce pending tasks with the same name, so duplicates of a
    /// step that is already waiting are dropped.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::SplitAndLaunch { job_id } => format!("split-{job_id}"),
            Self::FanOutShards { job_id } => format!("fanout-{job_id}"),
            Self::ProcessShard { shard_id, task_num } => format!("process-{shard_id}-{task_num}"),
            Self::UpdateJobState { job_id } => format!("update-{job_id}"),
        }
    }
}

/// A task plus delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    /// The payload.
    pub task: MapperTask,
    /// Delivery attempt (1-indexed).
    pub attempt: u32,
    /// When the first attempt was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// Wraps a task for its first attempt.
    #[must_use]
    pub fn new(task: MapperTask) -> Self {
        Self {
            task,
            attempt: 1,
            enqueued_at: Utc::now(),
        }
    }

    /// Returns the envelope for the next attempt of the same task.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// Deduplication key; see [`MapperTask::name`].
    #[must_use]
    pub fn name(&self) -> String {
        self.task.name()
    }

    /// Shortcut for `self.task.kind()`.
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        self.task.kind()
    }
}
