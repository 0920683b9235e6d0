//! In-memory store implementation for testing.
//!
//! This module provides [`InMemoryStore`], a simple in-memory implementation of
//! the [`MapperStore`] trait suitable for testing and development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **No persistence**: All state is lost when the process exits

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use shardmap_core::{JobId, ShardId};

use super::{CasResult, MapperStore};
use crate::error::{Error, Result};
use crate::job::Job;
use crate::shard::Shard;

#[derive(Debug, Default)]
struct StoreState {
    next_job_id: u64,
    jobs: HashMap<JobId, Job>,
    shards: BTreeMap<ShardId, Shard>,
}

/// In-memory store for testing.
///
/// Provides a thread-safe implementation of [`MapperStore`] using a single
/// `RwLock`, so every CAS is atomic with respect to other writers.
///
/// ## Example
///
/// ```rust
/// use shardmap_mapper::store::memory::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// assert_eq!(store.job_count().unwrap(), 0);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of jobs stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn job_count(&self) -> Result<usize> {
        let count = {
            let state = self.state.read().map_err(poison_err)?;
            state.jobs.len()
        };
        Ok(count)
    }
}

#[async_trait]
impl MapperStore for InMemoryStore {
    async fn allocate_job_id(&self) -> Result<JobId> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.next_job_id += 1;
        let id = JobId::new(state.next_job_id);
        drop(state);
        Ok(id)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.jobs.get(&job_id).cloned()
        };
        Ok(result)
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state.jobs.contains_key(&job.id) {
            drop(state);
            return Err(Error::storage(format!("job {} already exists", job.id)));
        }
        state.jobs.insert(job.id, job.clone());
        drop(state);
        Ok(())
    }

    async fn cas_job(&self, job: &Job) -> Result<CasResult> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(stored) = state.jobs.get_mut(&job.id) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };
        if stored.version != job.version {
            let actual = stored.version;
            drop(state);
            return Ok(CasResult::VersionConflict { actual });
        }
        let version = job.version + 1;
        *stored = Job {
            version,
            ..job.clone()
        };
        drop(state);
        Ok(CasResult::Success { version })
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = {
            let state = self.state.read().map_err(poison_err)?;
            state.jobs.values().cloned().collect()
        };
        jobs.sort_by(|a, b| b.id.cmp(&a.id));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn get_shard(&self, shard_id: &ShardId) -> Result<Option<Shard>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.shards.get(shard_id).cloned()
        };
        Ok(result)
    }

    async fn insert_shards(&self, shards: &[Shard]) -> Result<usize> {
        let mut state = self.state.write().map_err(poison_err)?;
        let mut written = 0;
        for shard in shards {
            if !state.shards.contains_key(&shard.id) {
                state.shards.insert(shard.id, shard.clone());
                written += 1;
            }
        }
        drop(state);
        Ok(written)
    }

    async fn cas_shard(&self, shard: &Shard) -> Result<CasResult> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(stored) = state.shards.get_mut(&shard.id) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };
        if stored.version != shard.version {
            let actual = stored.version;
            drop(state);
            return Ok(CasResult::VersionConflict { actual });
        }
        let version = shard.version + 1;
        *stored = Shard {
            version,
            ..shard.clone()
        };
        drop(state);
        Ok(CasResult::Success { version })
    }

    async fn list_shards(&self, job_id: JobId) -> Result<Vec<Shard>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .shards
                .range(ShardId::new(job_id, 0)..=ShardId::new(job_id, u32::MAX))
                .map(|(_, shard)| shard.clone())
                .collect()
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{EntityQuery, JobConfig, JobState};
    use crate::store::{TxOutcome, transact_job};
    use shardmap_core::KeyRange;

    fn job(id: JobId) -> Job {
        Job::new(id, JobConfig::new(EntityQuery::kind("Item"), "noop", 2))
    }

    #[tokio::test]
    async fn job_ids_increase() -> Result<()> {
        let store = InMemoryStore::new();
        let a = store.allocate_job_id().await?;
        let b = store.allocate_job_id().await?;
        assert!(b > a);
        Ok(())
    }

    #[tokio::test]
    async fn cas_job_detects_conflicts() -> Result<()> {
        let store = InMemoryStore::new();
        let id = store.allocate_job_id().await?;
        store.insert_job(&job(id)).await?;

        let mut first = store.get_job(id).await?.expect("job exists");
        let mut second = first.clone();

        first.transition_to(JobState::Running)?;
        assert_eq!(store.cas_job(&first).await?, CasResult::Success { version: 1 });

        second.transition_to(JobState::Aborted)?;
        assert_eq!(
            store.cas_job(&second).await?,
            CasResult::VersionConflict { actual: 1 }
        );

        let stored = store.get_job(id).await?.expect("job exists");
        assert_eq!(stored.state, JobState::Running);
        assert_eq!(stored.version, 1);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_job_insert_fails() -> Result<()> {
        let store = InMemoryStore::new();
        let id = store.allocate_job_id().await?;
        store.insert_job(&job(id)).await?;
        assert!(store.insert_job(&job(id)).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn list_jobs_newest_first() -> Result<()> {
        let store = InMemoryStore::new();
        for _ in 0..3 {
            let id = store.allocate_job_id().await?;
            store.insert_job(&job(id)).await?;
        }
        let jobs = store.list_jobs(2).await?;
        let ids: Vec<u64> = jobs.iter().map(|j| j.id.get()).collect();
        assert_eq!(ids, vec![3, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn shards_listed_per_job_in_order() -> Result<()> {
        let store = InMemoryStore::new();
        let (a, b) = (JobId::new(1), JobId::new(2));
        let shards = vec![
            Shard::new(ShardId::new(a, 1), KeyRange::unbounded(), 0),
            Shard::new(ShardId::new(b, 0), KeyRange::unbounded(), 0),
            Shard::new(ShardId::new(a, 0), KeyRange::unbounded(), 0),
        ];
        assert_eq!(store.insert_shards(&shards).await?, 3);
        assert_eq!(store.insert_shards(&shards).await?, 0);

        let listed = store.list_shards(a).await?;
        let indexes: Vec<u32> = listed.iter().map(Shard::index).collect();
        assert_eq!(indexes, vec![0, 1]);
        Ok(())
    }

    #[tokio::test]
    async fn transact_job_skip_leaves_record() -> Result<()> {
        let store = InMemoryStore::new();
        let id = store.allocate_job_id().await?;
        store.insert_job(&job(id)).await?;

        let (state, _) = transact_job(&store, id, 3, |job| Ok(TxOutcome::Skip(job.state))).await?;
        assert_eq!(state, JobState::Starting);
        assert_eq!(store.get_job(id).await?.expect("job").version, 0);
        Ok(())
    }

    #[tokio::test]
    async fn transact_job_missing_is_no_such_job() {
        let store = InMemoryStore::new();
        let result = transact_job(&store, JobId::new(99), 3, |_| Ok(TxOutcome::Skip(()))).await;
        assert!(matches!(result, Err(Error::NoSuchJob { .. })));
    }
}
