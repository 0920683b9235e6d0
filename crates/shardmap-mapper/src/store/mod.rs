//! Pluggable storage for job and shard records.
//!
//! The [`MapperStore`] trait defines the persistence layer. All state shared
//! between task invocations lives here; nothing crosses invocations in memory.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: every update is a compare-and-swap on a record version
//! - **Read-modify-write**: [`transact_job`] and [`transact_shard`] retry on
//!   version conflicts so callers see a single atomic update
//! - **Testability**: in-memory implementation for tests

pub mod memory;

use async_trait::async_trait;

use shardmap_core::{JobId, ShardId};

use crate::error::{Error, Result};
use crate::job::Job;
use crate::shard::Shard;

/// Result of a compare-and-swap operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Write applied; carries the new version.
    Success {
        /// Version now stored.
        version: u64,
    },
    /// Record not found.
    NotFound,
    /// Version conflict (concurrent modification).
    VersionConflict {
        /// The actual version that was found.
        actual: u64,
    },
}

impl CasResult {
    /// Returns true if the operation succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Storage abstraction for job and shard records.
///
/// ## CAS Semantics
///
/// `cas_job` and `cas_shard` write the record only if the stored version equals
/// the record's `version` field, then store it with `version + 1`. This is the
/// primitive that keeps concurrent deliveries from losing updates.
///
/// ## Errors
///
/// Retryable backend failures should be reported as
/// [`Error::Transient`](crate::error::Error::Transient).
#[async_trait]
pub trait MapperStore: Send + Sync {
    // --- Job operations ---

    /// Allocates the next job ID. IDs increase monotonically.
    async fn allocate_job_id(&self) -> Result<JobId>;

    /// Gets a job by ID.
    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Inserts a new job. Fails if the ID is already taken.
    async fn insert_job(&self, job: &Job) -> Result<()>;

    /// Writes `job` if its version matches the stored one.
    async fn cas_job(&self, job: &Job) -> Result<CasResult>;

    /// Lists jobs, newest first.
    async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>>;

    // --- Shard operations ---

    /// Gets a shard by ID.
    async fn get_shard(&self, shard_id: &ShardId) -> Result<Option<Shard>>;

    /// Inserts shards that do not exist yet; existing shards are left as is.
    ///
    /// Returns the number of shards written.
    async fn insert_shards(&self, shards: &[Shard]) -> Result<usize>;

    /// Writes `shard` if its version matches the stored one.
    async fn cas_shard(&self, shard: &Shard) -> Result<CasResult>;

    /// Lists a job's shards ordered by index.
    async fn list_shards(&self, job_id: JobId) -> Result<Vec<Shard>>;
}

/// Outcome of a read-modify-write closure.
#[derive(Debug)]
pub enum TxOutcome<T> {
    /// Persist the modified record and return the value.
    Commit(T),
    /// Leave the record untouched and return the value.
    Skip(T),
}

/// Default number of attempts for read-modify-write loops.
pub const DEFAULT_TRANSACTION_ATTEMPTS: u32 = 5;

/// Atomically reads, modifies, and writes a job.
///
/// `apply` may run several times if concurrent writers conflict; it must be
/// free of side effects beyond the record it is given. Returns the value from
/// the successful attempt and the record as stored.
///
/// # Errors
///
/// - [`Error::NoSuchJob`] if the job does not exist
/// - [`Error::Transient`] if every attempt conflicted
/// - any error returned by `apply`
pub async fn transact_job<T, F>(
    store: &dyn MapperStore,
    job_id: JobId,
    attempts: u32,
    mut apply: F,
) -> Result<(T, Job)>
where
    F: FnMut(&mut Job) -> Result<TxOutcome<T>> + Send,
    T: Send,
{
    for attempt in 1..=attempts.max(1) {
        let mut job = store
            .get_job(job_id)
            .await?
            .ok_or(Error::NoSuchJob { job_id })?;
        match apply(&mut job)? {
            TxOutcome::Skip(value) => return Ok((value, job)),
            TxOutcome::Commit(value) => match store.cas_job(&job).await? {
                CasResult::Success { version } => {
                    job.version = version;
                    return Ok((value, job));
                }
                CasResult::NotFound => return Err(Error::NoSuchJob { job_id }),
                CasResult::VersionConflict { actual } => {
                    tracing::debug!(%job_id, attempt, actual, "job write conflicted, retrying");
                }
            },
        }
    }
    Err(Error::transient(format!(
        "job {job_id}: too much contention after {attempts} attempts"
    )))
}

/// Atomically reads, modifies, and writes a shard.
///
/// See [`transact_job`] for the contract of `apply`.
///
/// # Errors
///
/// - [`Error::ShardNotFound`] if the shard does not exist
/// - [`Error::Transient`] if every attempt conflicted
/// - any error returned by `apply`
pub async fn transact_shard<T, F>(
    store: &dyn MapperStore,
    shard_id: ShardId,
    attempts: u32,
    mut apply: F,
) -> Result<(T, Shard)>
where
    F: FnMut(&mut Shard) -> Result<TxOutcome<T>> + Send,
    T: Send,
{
    for attempt in 1..=attempts.max(1) {
        let mut shard = store
            .get_shard(&shard_id)
            .await?
            .ok_or(Error::ShardNotFound { shard_id })?;
        match apply(&mut shard)? {
            TxOutcome::Skip(value) => return Ok((value, shard)),
            TxOutcome::Commit(value) => match store.cas_shard(&shard).await? {
                CasResult::Success { version } => {
                    shard.version = version;
                    return Ok((value, shard));
                }
                CasResult::NotFound => return Err(Error::ShardNotFound { shard_id }),
                CasResult::VersionConflict { actual } => {
                    tracing::debug!(%shard_id, attempt, actual, "shard write conflicted, retrying");
                }
            },
        }
    }
    Err(Error::transient(format!(
        "shard {shard_id}: too much contention after {attempts} attempts"
    )))
}

/// Writes a shard the caller already holds, without re-reading it.
///
/// Used for checkpoints inside a single `ProcessShard` invocation, where the
/// caller owns the latest version. A conflict means another delivery touched
/// the shard and is reported as transient so this delivery is retried.
///
/// # Errors
///
/// - [`Error::ShardNotFound`] if the shard vanished
/// - [`Error::Transient`] on a version conflict
pub async fn checkpoint_shard(store: &dyn MapperStore, shard: &mut Shard) -> Result<()> {
    match store.cas_shard(shard).await? {
        CasResult::Success { version } => {
            shard.version = version;
            Ok(())
        }
        CasResult::NotFound => Err(Error::ShardNotFound { shard_id: shard.id }),
        CasResult::VersionConflict { actual } => Err(Error::transient(format!(
            "shard {} changed underneath this task (expected version {}, found {actual})",
            shard.id, shard.version
        ))),
    }
}
