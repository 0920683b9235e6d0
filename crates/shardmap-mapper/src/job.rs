//! Job records, the job state machine, and the job read model.
//!
//! ```text
//! ┌──────────┐  shards created  ┌─────────┐  all shards terminal  ┌──────────────┐
//! │ STARTING │─────────────────►│ RUNNING │──────────────────────►│ SUCCESS/FAIL │
//! └──────────┘                  └─────────┘                       └──────────────┘
//!      │ abort                       │ abort
//!      ▼                             ▼
//! ┌─────────┐                  ┌──────────┐  all shards terminal
//! │ ABORTED │◄─────────────────│ ABORTING │──────────────────────► (aggregate)
//! └─────────┘                  └──────────┘
//! ```
//!
//! A job only becomes terminal once every shard is terminal. The terminal
//! state is derived by [`aggregate_state`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shardmap_core::{JobId, KeyRange, MapperId};

use crate::error::{Error, Result};
use crate::shard::{Shard, ShardState};
use crate::store::MapperStore;

/// Job state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Shards not yet created or launched.
    Starting,
    /// All shards have been dispatched.
    Running,
    /// Every shard succeeded.
    Success,
    /// At least one shard failed.
    Fail,
    /// Abort requested; waiting for shards to observe it.
    Aborting,
    /// Abort completed.
    Aborted,
}

impl JobState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fail | Self::Aborted)
    }

    /// Returns true if shards should stop processing.
    #[must_use]
    pub const fn is_aborting(&self) -> bool {
        matches!(self, Self::Aborting | Self::Aborted)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Starting => matches!(target, Self::Running | Self::Aborting | Self::Aborted),
            Self::Running => matches!(target, Self::Success | Self::Fail | Self::Aborting),
            Self::Aborting => matches!(target, Self::Aborted | Self::Fail | Self::Success),
            Self::Success | Self::Fail | Self::Aborted => false,
        }
    }

    /// Lowercase label used in metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Aborting => "aborting",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Fail => write!(f, "FAIL"),
            Self::Aborting => write!(f, "ABORTING"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// The keys a job maps over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityQuery {
    /// Entity kind to iterate.
    pub kind: String,
    /// Restriction within the kind.
    #[serde(default)]
    pub range: KeyRange,
}

impl EntityQuery {
    /// Query over every entity of `kind`.
    #[must_use]
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            range: KeyRange::unbounded(),
        }
    }

    /// Restricts the query to `range`.
    #[must_use]
    pub fn with_range(mut self, range: KeyRange) -> Self {
        self.range = range;
        self
    }
}

/// Default number of keys per page.
pub const DEFAULT_PAGE_SIZE: u32 = 256;
/// Default number of pages per `ProcessShard` task.
pub const DEFAULT_PAGES_PER_TASK: u32 = 8;

/// Configuration of a mapping job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    /// Keys to map over.
    pub query: EntityQuery,
    /// Registered mapper to invoke.
    pub mapper_id: MapperId,
    /// Opaque parameters handed to every mapper invocation.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Requested number of shards. The splitter may produce fewer.
    pub shard_count: u32,
    /// Maximum keys per page.
    pub page_size: u32,
    /// Pages processed per task invocation.
    pub pages_per_task: u32,
    /// Count each shard's range exactly so progress can be reported.
    #[serde(default)]
    pub track_progress: bool,
}

impl JobConfig {
    /// Creates a config with default paging and progress tracking enabled.
    #[must_use]
    pub fn new(query: EntityQuery, mapper_id: impl Into<MapperId>, shard_count: u32) -> Self {
        Self {
            query,
            mapper_id: mapper_id.into(),
            params: serde_json::Value::Null,
            shard_count,
            page_size: DEFAULT_PAGE_SIZE,
            pages_per_task: DEFAULT_PAGES_PER_TASK,
            track_progress: true,
        }
    }

    /// Sets the page size.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the pages per task.
    #[must_use]
    pub const fn with_pages_per_task(mut self, pages_per_task: u32) -> Self {
        self.pages_per_task = pages_per_task;
        self
    }

    /// Sets the mapper parameters.
    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Enables or disables exact per-shard counting.
    #[must_use]
    pub const fn with_track_progress(mut self, track_progress: bool) -> Self {
        self.track_progress = track_progress;
        self
    }

    /// Checks the structural constraints of the config.
    ///
    /// Mapper registration is checked separately by the controller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.query.kind.trim().is_empty() {
            return Err(Error::invalid_config("query kind must not be empty"));
        }
        if self.query.range.is_empty() {
            return Err(Error::invalid_config(format!(
                "query range {} is empty",
                self.query.range
            )));
        }
        if self.shard_count == 0 {
            return Err(Error::invalid_config("shard count must be greater than 0"));
        }
        if self.page_size == 0 {
            return Err(Error::invalid_config("page size must be greater than 0"));
        }
        if self.pages_per_task == 0 {
            return Err(Error::invalid_config(
                "pages per task must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Persisted record of a mapping job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Job identifier.
    pub id: JobId,
    /// Configuration captured at launch.
    pub config: JobConfig,
    /// Current state.
    pub state: JobState,
    /// Summary of the first shard failure, set on FAIL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the job was launched.
    pub created_at: DateTime<Utc>,
    /// Last state-affecting write.
    pub updated_at: DateTime<Utc>,
    /// Store-managed version for compare-and-swap writes.
    #[serde(default)]
    pub version: u64,
}

impl Job {
    /// Creates a job in `STARTING`.
    #[must_use]
    pub fn new(id: JobId, config: JobConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            config,
            state: JobState::Starting,
            error: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Returns true if the job will not change again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Transitions to `target`, refreshing `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the state machine forbids
    /// the move.
    pub fn transition_to(&mut self, target: JobState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: format!("job {} forbids this transition", self.id),
            });
        }
        self.state = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Applies the aggregate outcome of `shards`, if every shard is terminal.
    ///
    /// Returns the new state when the job was finalized.
    ///
    /// # Errors
    ///
    /// Returns an error if the aggregate state is not reachable from the
    /// current state.
    pub fn finalize_from(&mut self, shards: &[Shard]) -> Result<Option<JobState>> {
        let Some(target) = aggregate_state(shards) else {
            return Ok(None);
        };
        self.transition_to(target)?;
        if target == JobState::Fail {
            self.error = shards
                .iter()
                .find(|s| s.state == ShardState::Fail)
                .map(|s| format!("shard {}: {}", s.index(), s.error.as_deref().unwrap_or("failed")));
        }
        Ok(Some(target))
    }

    /// Builds the read model by loading this job's shards.
    ///
    /// # Errors
    ///
    /// Returns an error if the shards cannot be listed.
    pub async fn fetch_info(&self, store: &dyn MapperStore) -> Result<JobInfo> {
        let shards = store.list_shards(self.id).await?;
        Ok(JobInfo::build(self, &shards, Utc::now()))
    }
}

/// Derives a job's terminal state from its shards.
///
/// Returns `None` while any shard is still active. Otherwise: any FAIL gives
/// FAIL, else any ABORTED gives ABORTED, else SUCCESS.
#[must_use]
pub fn aggregate_state(shards: &[Shard]) -> Option<JobState> {
    if shards.iter().any(|s| !s.is_terminal()) {
        return None;
    }
    if shards.iter().any(|s| s.state == ShardState::Fail) {
        Some(JobState::Fail)
    } else if shards.iter().any(|s| s.state == ShardState::Aborted) {
        Some(JobState::Aborted)
    } else {
        Some(JobState::Success)
    }
}

/// Per-shard summary in [`JobInfo`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardInfo {
    /// Shard index.
    pub index: u32,
    /// Current state.
    pub state: ShardState,
    /// Range assigned to the shard.
    pub range: KeyRange,
    /// Estimated entities.
    pub expected_count: u64,
    /// Entities processed.
    pub processed_count: u64,
    /// Progress in percent, when an estimate exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<f64>,
    /// Failure text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Read model of a job and its shards. Recomputed on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    /// Job identifier.
    pub id: JobId,
    /// Current state.
    pub state: JobState,
    /// Mapper being run.
    pub mapper_id: MapperId,
    /// Sum of shard estimates.
    pub total_entities: u64,
    /// Sum of processed counts.
    pub processed_entities: u64,
    /// Processing rate since launch.
    pub entities_per_sec: f64,
    /// Launch time.
    pub created_at: DateTime<Utc>,
    /// Last update.
    pub updated_at: DateTime<Utc>,
    /// Failure summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-shard summaries, ordered by index.
    pub shards: Vec<ShardInfo>,
}

impl JobInfo {
    /// Aggregates a job and its shards.
    ///
    /// The rate is measured up to `updated_at` for terminal jobs and up to
    /// `now` otherwise.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn build(job: &Job, shards: &[Shard], now: DateTime<Utc>) -> Self {
        let total_entities = shards.iter().map(|s| s.expected_count).sum();
        let processed_entities: u64 = shards.iter().map(|s| s.processed_count).sum();
        let until = if job.is_terminal() { job.updated_at } else { now };
        let elapsed_ms = (until - job.created_at).num_milliseconds();
        let entities_per_sec = if elapsed_ms > 0 {
            processed_entities as f64 * 1000.0 / elapsed_ms as f64
        } else {
            0.0
        };

        Self {
            id: job.id,
            state: job.state,
            mapper_id: job.config.mapper_id.clone(),
            total_entities,
            processed_entities,
            entities_per_sec,
            created_at: job.created_at,
            updated_at: job.updated_at,
            error: job.error.clone(),
            shards: shards
                .iter()
                .map(|s| ShardInfo {
                    index: s.index(),
                    state: s.state,
                    range: s.range.clone(),
                    expected_count: s.expected_count,
                    processed_count: s.processed_count,
                    progress_percent: s.progress_percent(),
                    error: s.error.clone(),
                })
                .collect(),
        }
    }
}
