//! Test store with operation tracing.
//!
//! [`TracingStore`] wraps an [`InMemoryStore`], records every operation for
//! later assertions, and can fail upcoming writes with transient errors.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use shardmap_core::{JobId, ShardId};
use shardmap_mapper::error::{Error, Result};
use shardmap_mapper::job::{Job, JobState};
use shardmap_mapper::shard::{Shard, ShardState};
use shardmap_mapper::store::memory::InMemoryStore;
use shardmap_mapper::store::{CasResult, MapperStore};

/// Record of a store operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Job ID allocation.
    AllocateJobId,
    /// Job read.
    GetJob {
        /// Job that was read.
        job_id: JobId,
    },
    /// Job insert.
    InsertJob {
        /// Job that was inserted.
        job_id: JobId,
    },
    /// Job compare-and-swap.
    CasJob {
        /// Job that was written.
        job_id: JobId,
        /// State carried by the write.
        state: JobState,
        /// True if the write was applied.
        applied: bool,
    },
    /// Job listing.
    ListJobs,
    /// Shard read.
    GetShard {
        /// Shard that was read.
        shard_id: ShardId,
    },
    /// Shard insert.
    InsertShards {
        /// Number of shards offered.
        count: usize,
    },
    /// Shard compare-and-swap.
    CasShard {
        /// Shard that was written.
        shard_id: ShardId,
        /// State carried by the write.
        state: ShardState,
        /// Processed count carried by the write.
        processed_count: u64,
        /// Task number carried by the write.
        process_task_num: u32,
        /// True if the write was applied.
        applied: bool,
    },
    /// Shard listing.
    ListShards {
        /// Job whose shards were listed.
        job_id: JobId,
    },
}

/// In-memory store with operation tracing and failure injection.
#[derive(Debug, Clone, Default)]
pub struct TracingStore {
    inner: Arc<InMemoryStore>,
    operations: Arc<Mutex<Vec<StoreOp>>>,
    failing_writes: Arc<AtomicU32>,
    failing_shard_writes: Arc<AtomicU32>,
}

impl TracingStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StoreOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Returns the applied shard writes for `shard_id`, in order.
    #[must_use]
    pub fn shard_writes(&self, shard_id: ShardId) -> Vec<StoreOp> {
        self.operations()
            .into_iter()
            .filter(|op| {
                matches!(op, StoreOp::CasShard { shard_id: id, applied: true, .. } if *id == shard_id)
            })
            .collect()
    }

    /// Fails the next `count` writes of any record with a transient error.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Fails the next `count` shard compare-and-swaps with a transient error.
    pub fn fail_next_shard_writes(&self, count: u32) {
        self.failing_shard_writes.store(count, Ordering::SeqCst);
    }

    fn record(&self, op: StoreOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_write(&self) -> Result<()> {
        if Self::take_failure(&self.failing_writes) {
            return Err(Error::transient("injected write failure"));
        }
        Ok(())
    }

    fn check_shard_write(&self) -> Result<()> {
        self.check_write()?;
        if Self::take_failure(&self.failing_shard_writes) {
            return Err(Error::transient("injected shard write failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl MapperStore for TracingStore {
    async fn allocate_job_id(&self) -> Result<JobId> {
        self.record(StoreOp::AllocateJobId);
        self.inner.allocate_job_id().await
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        self.record(StoreOp::GetJob { job_id });
        self.inner.get_job(job_id).await
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        self.record(StoreOp::InsertJob { job_id: job.id });
        self.check_write()?;
        self.inner.insert_job(job).await
    }

    async fn cas_job(&self, job: &Job) -> Result<CasResult> {
        self.check_write()?;
        let result = self.inner.cas_job(job).await?;
        self.record(StoreOp::CasJob {
            job_id: job.id,
            state: job.state,
            applied: result.is_success(),
        });
        Ok(result)
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        self.record(StoreOp::ListJobs);
        self.inner.list_jobs(limit).await
    }

    async fn get_shard(&self, shard_id: &ShardId) -> Result<Option<Shard>> {
        self.record(StoreOp::GetShard { shard_id: *shard_id });
        self.inner.get_shard(shard_id).await
    }

    async fn insert_shards(&self, shards: &[Shard]) -> Result<usize> {
        self.record(StoreOp::InsertShards { count: shards.len() });
        self.check_write()?;
        self.inner.insert_shards(shards).await
    }

    async fn cas_shard(&self, shard: &Shard) -> Result<CasResult> {
        self.check_shard_write()?;
        let result = self.inner.cas_shard(shard).await?;
        self.record(StoreOp::CasShard {
            shard_id: shard.id,
            state: shard.state,
            processed_count: shard.processed_count,
            process_task_num: shard.process_task_num,
            applied: result.is_success(),
        });
        Ok(result)
    }

    async fn list_shards(&self, job_id: JobId) -> Result<Vec<Shard>> {
        self.record(StoreOp::ListShards { job_id });
        self.inner.list_shards(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardmap_core::KeyRange;
    use shardmap_mapper::job::{EntityQuery, JobConfig};

    fn job(id: JobId) -> Job {
        Job::new(id, JobConfig::new(EntityQuery::kind("Item"), "noop", 1))
    }

    #[tokio::test]
    async fn tracing_store_records_operations() -> Result<()> {
        let store = TracingStore::new();
        let id = store.allocate_job_id().await?;
        store.insert_job(&job(id)).await?;
        store.get_job(id).await?;

        assert_eq!(
            store.operations(),
            vec![
                StoreOp::AllocateJobId,
                StoreOp::InsertJob { job_id: id },
                StoreOp::GetJob { job_id: id },
            ]
        );
        store.clear_operations();
        assert!(store.operations().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_bounded() -> Result<()> {
        let store = TracingStore::new();
        let shard = Shard::new(ShardId::new(JobId::new(1), 0), KeyRange::unbounded(), 0);
        store.insert_shards(&[shard.clone()]).await?;

        store.fail_next_shard_writes(1);
        let err = store.cas_shard(&shard).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.cas_shard(&shard).await?.is_success());
        assert_eq!(store.shard_writes(shard.id).len(), 1);
        Ok(())
    }
}
