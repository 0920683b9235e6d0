//! Deterministic fault injection.
//!
//! A [`SimulationHarness`] owns a seeded RNG and a [`FaultConfig`]. Wrappers
//! consult it to decide whether an operation fails:
//!
//! - [`ChaosStore`] fails store reads and writes with transient errors and
//!   reports spurious version conflicts
//! - [`ChaosMapperFactory`] makes mapper pages fail transiently
//!
//! With a single-threaded worker the order of decisions is fixed, so a seed
//! reproduces the same run.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use shardmap_test_utils::simulation::{ChaosStore, FaultConfig, SimulationHarness};
//!
//! let harness = Arc::new(SimulationHarness::with_seed(12345));
//! harness.configure_faults(FaultConfig::contended_store());
//! let store = ChaosStore::new(Arc::new(InMemoryStore::new()), harness.clone());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use shardmap_core::{JobId, Key, ShardId};
use shardmap_mapper::error::{Error, Result};
use shardmap_mapper::job::Job;
use shardmap_mapper::registry::{MapContext, Mapper, MapperError, MapperFactory};
use shardmap_mapper::shard::Shard;
use shardmap_mapper::store::{CasResult, MapperStore};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a store read failing (0.0 - 1.0).
    pub store_read_failure_rate: f64,
    /// Probability of a store write failing before it is applied.
    pub store_write_failure_rate: f64,
    /// Probability of a CAS reporting a conflict without writing.
    pub cas_conflict_rate: f64,
    /// Probability of a mapper page failing transiently.
    pub mapper_failure_rate: f64,
}

impl FaultConfig {
    /// Creates a config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Creates a config simulating a contended store.
    #[must_use]
    pub fn contended_store() -> Self {
        Self {
            cas_conflict_rate: 0.2,
            ..Self::default()
        }
    }

    /// Creates a config where everything can fail.
    #[must_use]
    pub fn chaos() -> Self {
        Self {
            store_read_failure_rate: 0.05,
            store_write_failure_rate: 0.05,
            cas_conflict_rate: 0.1,
            mapper_failure_rate: 0.1,
        }
    }
}

/// Seeded source of fault decisions.
#[derive(Debug)]
pub struct SimulationHarness {
    seed: u64,
    rng: Mutex<StdRng>,
    faults: Mutex<FaultConfig>,
    injected: AtomicU64,
}

impl SimulationHarness {
    /// Creates a harness with the given seed and no faults.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            faults: Mutex::new(FaultConfig::no_faults()),
            injected: AtomicU64::new(0),
        }
    }

    /// Returns the seed, for reproducing a failing run.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Replaces the fault configuration.
    pub fn configure_faults(&self, config: FaultConfig) {
        *self.faults.lock().expect("lock poisoned") = config;
    }

    /// Returns the current fault configuration.
    #[must_use]
    pub fn faults(&self) -> FaultConfig {
        self.faults.lock().expect("lock poisoned").clone()
    }

    /// Returns true with the given probability.
    pub fn should_fail(&self, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        let fail = self.rng.lock().expect("lock poisoned").r#gen::<f64>() < probability;
        if fail {
            self.injected.fetch_add(1, Ordering::Relaxed);
        }
        fail
    }

    /// Decides whether a store read fails.
    pub fn should_fail_store_read(&self) -> bool {
        self.should_fail(self.faults().store_read_failure_rate)
    }

    /// Decides whether a store write fails.
    pub fn should_fail_store_write(&self) -> bool {
        self.should_fail(self.faults().store_write_failure_rate)
    }

    /// Decides whether a CAS reports a spurious conflict.
    pub fn should_conflict(&self) -> bool {
        self.should_fail(self.faults().cas_conflict_rate)
    }

    /// Decides whether a mapper page fails.
    pub fn should_fail_mapper(&self) -> bool {
        self.should_fail(self.faults().mapper_failure_rate)
    }

    /// Returns how many faults have been injected.
    #[must_use]
    pub fn injected_count(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }
}

impl Default for SimulationHarness {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

/// Store wrapper that injects faults chosen by a [`SimulationHarness`].
///
/// Faults are injected before the inner store is touched, so a failed write
/// never leaves a partial update behind.
pub struct ChaosStore {
    inner: Arc<dyn MapperStore>,
    harness: Arc<SimulationHarness>,
}

impl std::fmt::Debug for ChaosStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosStore")
            .field("harness", &self.harness)
            .finish_non_exhaustive()
    }
}

impl ChaosStore {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn MapperStore>, harness: Arc<SimulationHarness>) -> Self {
        Self { inner, harness }
    }

    fn read(&self) -> Result<()> {
        if self.harness.should_fail_store_read() {
            return Err(Error::transient("injected read failure"));
        }
        Ok(())
    }

    fn write(&self) -> Result<()> {
        if self.harness.should_fail_store_write() {
            return Err(Error::transient("injected write failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl MapperStore for ChaosStore {
    async fn allocate_job_id(&self) -> Result<JobId> {
        self.inner.allocate_job_id().await
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        self.read()?;
        self.inner.get_job(job_id).await
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        self.write()?;
        self.inner.insert_job(job).await
    }

    async fn cas_job(&self, job: &Job) -> Result<CasResult> {
        self.write()?;
        if self.harness.should_conflict() {
            return Ok(CasResult::VersionConflict {
                actual: job.version + 1,
            });
        }
        self.inner.cas_job(job).await
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        self.read()?;
        self.inner.list_jobs(limit).await
    }

    async fn get_shard(&self, shard_id: &ShardId) -> Result<Option<Shard>> {
        self.read()?;
        self.inner.get_shard(shard_id).await
    }

    async fn insert_shards(&self, shards: &[Shard]) -> Result<usize> {
        self.write()?;
        self.inner.insert_shards(shards).await
    }

    async fn cas_shard(&self, shard: &Shard) -> Result<CasResult> {
        self.write()?;
        if self.harness.should_conflict() {
            return Ok(CasResult::VersionConflict {
                actual: shard.version + 1,
            });
        }
        self.inner.cas_shard(shard).await
    }

    async fn list_shards(&self, job_id: JobId) -> Result<Vec<Shard>> {
        self.read()?;
        self.inner.list_shards(job_id).await
    }
}

/// Mapper factory wrapper whose mappers fail pages transiently at random.
pub struct ChaosMapperFactory {
    inner: Arc<dyn MapperFactory>,
    harness: Arc<SimulationHarness>,
}

impl ChaosMapperFactory {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn MapperFactory>, harness: Arc<SimulationHarness>) -> Self {
        Self { inner, harness }
    }
}

impl MapperFactory for ChaosMapperFactory {
    fn create(&self, job: &Job, shard_index: u32) -> Result<Arc<dyn Mapper>> {
        Ok(Arc::new(ChaosMapper {
            inner: self.inner.create(job, shard_index)?,
            harness: self.harness.clone(),
        }))
    }
}

struct ChaosMapper {
    inner: Arc<dyn Mapper>,
    harness: Arc<SimulationHarness>,
}

#[async_trait]
impl Mapper for ChaosMapper {
    async fn map(&self, ctx: &MapContext<'_>, keys: &[Key]) -> std::result::Result<(), MapperError> {
        if self.harness.should_fail_mapper() {
            return Err(MapperError::transient("injected mapper failure"));
        }
        self.inner.map(ctx, keys).await
    }
}
