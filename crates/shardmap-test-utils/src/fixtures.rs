//! Pre-built test fixtures for common scenarios.
//!
//! [`TestHarness`] wires a controller to in-memory collaborators and a
//! [`LocalWorker`]. [`MapperScript`] builds mappers that count what they see
//! and fail at chosen pages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use shardmap_core::{JobId, Key};
use shardmap_mapper::config::{ControllerConfig, WorkerConfig};
use shardmap_mapper::controller::Controller;
use shardmap_mapper::dispatch::memory::InMemoryTaskQueue;
use shardmap_mapper::dispatch::worker::{Delivery, DeliveryStats, LocalWorker};
use shardmap_mapper::error::Result;
use shardmap_mapper::job::{EntityQuery, Job, JobConfig, JobInfo};
use shardmap_mapper::registry::{MapContext, Mapper, MapperError, MapperFactory, MapperRegistry};
use shardmap_mapper::shard::Shard;
use shardmap_mapper::source::memory::InMemoryEntities;
use shardmap_mapper::store::memory::InMemoryStore;
use shardmap_mapper::store::MapperStore;

/// Controller plus in-memory collaborators, ready to run jobs.
pub struct TestHarness {
    /// Job and shard records.
    pub store: Arc<dyn MapperStore>,
    /// Entity keys.
    pub source: Arc<InMemoryEntities>,
    /// Task queue drained by `worker`.
    pub queue: Arc<InMemoryTaskQueue>,
    /// Mapper registry shared with the controller.
    pub registry: Arc<MapperRegistry>,
    /// Controller under test.
    pub controller: Arc<Controller>,
    /// Worker with the controller installed.
    pub worker: LocalWorker,
}

impl TestHarness {
    /// Creates a harness over a fresh [`InMemoryStore`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryStore::new()))
    }

    /// Creates a harness over `store`.
    #[must_use]
    pub fn with_store(store: Arc<dyn MapperStore>) -> Self {
        Self::build(store, ControllerConfig::default(), test_worker_config())
    }

    /// Creates a harness with explicit configuration.
    #[must_use]
    pub fn build(
        store: Arc<dyn MapperStore>,
        controller_config: ControllerConfig,
        worker_config: WorkerConfig,
    ) -> Self {
        let source = Arc::new(InMemoryEntities::new());
        let queue = Arc::new(InMemoryTaskQueue::new("test"));
        let registry = Arc::new(MapperRegistry::new());
        let controller = Arc::new(
            Controller::new(store.clone(), source.clone(), queue.clone(), registry.clone())
                .with_config(controller_config),
        );
        let mut worker = LocalWorker::new(queue.clone(), worker_config);
        controller.install(&mut worker);
        Self {
            store,
            source,
            queue,
            registry,
            controller,
            worker,
        }
    }

    /// Seeds entities `kind(1)..=kind(count)`.
    pub fn seed(&self, kind: &str, count: i64) {
        self.source.insert_ids(kind, 1..=count).expect("seed entities");
    }

    /// Registers a mapper factory.
    pub fn register(&self, mapper_id: &str, factory: impl MapperFactory + 'static) {
        self.registry
            .register_factory(mapper_id, factory)
            .expect("register mapper");
    }

    /// Launches a job.
    pub async fn launch(&self, config: JobConfig) -> JobId {
        self.controller.launch_job(config).await.expect("launch job")
    }

    /// Delivers tasks until the queue is empty.
    pub async fn run(&self) -> DeliveryStats {
        self.worker.run_until_idle().await.expect("worker run")
    }

    /// Delivers a single task.
    pub async fn step(&self) -> Option<Delivery> {
        self.worker.run_once().await.expect("worker step")
    }

    /// Returns the job record.
    pub async fn job(&self, job_id: JobId) -> Job {
        self.controller.get_job(job_id).await.expect("job exists")
    }

    /// Returns the job's shards ordered by index.
    pub async fn shards(&self, job_id: JobId) -> Vec<Shard> {
        self.controller.fetch_shards(job_id).await.expect("list shards")
    }

    /// Returns the job read model.
    pub async fn info(&self, job_id: JobId) -> JobInfo {
        self.controller
            .fetch_job_info(job_id)
            .await
            .expect("job info")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker settings for tests: generous attempts, deliveries bounded.
#[must_use]
pub fn test_worker_config() -> WorkerConfig {
    WorkerConfig {
        max_attempts: 25,
        retry_delay: Duration::from_millis(500),
        max_deliveries: 10_000,
        real_time: false,
    }
}

/// Job config over every entity of `kind`.
#[must_use]
pub fn job_config(kind: &str, mapper_id: &str, shards: u32) -> JobConfig {
    JobConfig::new(EntityQuery::kind(kind), mapper_id, shards)
}

/// Shared state of scripted mappers.
///
/// Counts calls and keys per shard across mapper instances, and fails the
/// `n`th call of a shard when told to. Each scripted failure fires once.
#[derive(Debug, Default)]
pub struct MapperScript {
    calls: Mutex<HashMap<u32, u32>>,
    keys: Mutex<HashMap<u32, u64>>,
    failures: Mutex<HashMap<(u32, u32), MapperError>>,
    total_keys: AtomicU64,
}

impl MapperScript {
    /// Creates a script with no failures.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails call number `call` (1-based) of shard `shard` with `error`.
    pub fn fail_on(&self, shard: u32, call: u32, error: MapperError) {
        self.failures
            .lock()
            .expect("lock")
            .insert((shard, call), error);
    }

    /// Number of map calls made for `shard`, failed ones included.
    #[must_use]
    pub fn calls(&self, shard: u32) -> u32 {
        self.calls.lock().expect("lock").get(&shard).copied().unwrap_or(0)
    }

    /// Keys successfully mapped for `shard`.
    #[must_use]
    pub fn keys(&self, shard: u32) -> u64 {
        self.keys.lock().expect("lock").get(&shard).copied().unwrap_or(0)
    }

    /// Keys successfully mapped across all shards.
    #[must_use]
    pub fn total_keys(&self) -> u64 {
        self.total_keys.load(Ordering::SeqCst)
    }

    /// Factory producing mappers driven by this script.
    #[must_use]
    pub fn factory(self: &Arc<Self>) -> impl MapperFactory + 'static {
        let script = self.clone();
        move |_: &Job, _: u32| -> Result<Arc<dyn Mapper>> {
            Ok(Arc::new(ScriptedMapper {
                script: script.clone(),
            }))
        }
    }

    fn on_call(&self, shard: u32, keys: usize) -> std::result::Result<(), MapperError> {
        let call = {
            let mut calls = self.calls.lock().expect("lock");
            let entry = calls.entry(shard).or_insert(0);
            *entry += 1;
            *entry
        };
        if let Some(error) = self.failures.lock().expect("lock").remove(&(shard, call)) {
            return Err(error);
        }
        *self.keys.lock().expect("lock").entry(shard).or_insert(0) += keys as u64;
        self.total_keys.fetch_add(keys as u64, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedMapper {
    script: Arc<MapperScript>,
}

#[async_trait]
impl Mapper for ScriptedMapper {
    async fn map(&self, ctx: &MapContext<'_>, keys: &[Key]) -> std::result::Result<(), MapperError> {
        self.script.on_call(ctx.shard_index, keys.len())
    }
}
