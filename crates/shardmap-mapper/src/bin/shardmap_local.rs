//! Local mapper run.
//!
//! Seeds an in-memory entity set, launches one job with a counting mapper,
//! drives it to completion with a [`LocalWorker`], and prints the job info as
//! JSON on stdout.
//!
//! Environment:
//!
//! - `SHARDMAP_LOG_FORMAT`: `json` or `pretty` (default)
//! - `SHARDMAP_LOCAL_KIND`: entity kind (default `Entity`)
//! - `SHARDMAP_LOCAL_ENTITIES`: number of entities to seed (default 512)
//! - `SHARDMAP_LOCAL_SHARDS`: shard count (default 4)
//! - `SHARDMAP_LOCAL_PAGE_SIZE`: keys per page (default 256)
//! - `SHARDMAP_LOCAL_PAGES_PER_TASK`: pages per task (default 8)
//! - plus the controller and worker variables read by `ControllerConfig` and
//!   `WorkerConfig`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use shardmap_core::observability::{init_logging, LogFormat};
use shardmap_core::{EnvReader, Key};
use shardmap_mapper::config::{ControllerConfig, WorkerConfig};
use shardmap_mapper::controller::Controller;
use shardmap_mapper::dispatch::memory::InMemoryTaskQueue;
use shardmap_mapper::dispatch::worker::LocalWorker;
use shardmap_mapper::error::{Error, Result};
use shardmap_mapper::job::{EntityQuery, Job, JobConfig, DEFAULT_PAGES_PER_TASK, DEFAULT_PAGE_SIZE};
use shardmap_mapper::registry::{MapContext, Mapper, MapperError, MapperRegistry};
use shardmap_mapper::source::memory::InMemoryEntities;
use shardmap_mapper::store::memory::InMemoryStore;

const MAPPER_ID: &str = "count";

struct CountingMapper {
    seen: Arc<AtomicU64>,
}

#[async_trait]
impl Mapper for CountingMapper {
    async fn map(&self, ctx: &MapContext<'_>, keys: &[Key]) -> std::result::Result<(), MapperError> {
        self.seen.fetch_add(keys.len() as u64, Ordering::Relaxed);
        tracing::trace!(shard = ctx.shard_index, keys = keys.len(), "mapped page");
        Ok(())
    }
}

fn log_format(env: &EnvReader) -> LogFormat {
    env.string("SHARDMAP_LOG_FORMAT")
        .and_then(|value| LogFormat::parse(&value))
        .unwrap_or(LogFormat::Pretty)
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = EnvReader::process();
    init_logging(log_format(&env));

    let kind = env
        .string("SHARDMAP_LOCAL_KIND")
        .unwrap_or_else(|| "Entity".to_string());
    let entities = env.u64("SHARDMAP_LOCAL_ENTITIES")?.unwrap_or(512);
    let shards = env.u32("SHARDMAP_LOCAL_SHARDS")?.unwrap_or(4);
    let page_size = env.u32("SHARDMAP_LOCAL_PAGE_SIZE")?.unwrap_or(DEFAULT_PAGE_SIZE);
    let pages_per_task = env
        .u32("SHARDMAP_LOCAL_PAGES_PER_TASK")?
        .unwrap_or(DEFAULT_PAGES_PER_TASK);

    let source = Arc::new(InMemoryEntities::new());
    let last = i64::try_from(entities)
        .map_err(|_| Error::invalid_config("SHARDMAP_LOCAL_ENTITIES is too large"))?;
    source.insert_ids(&kind, 1..=last)?;

    let seen = Arc::new(AtomicU64::new(0));
    let registry = Arc::new(MapperRegistry::new());
    let counter = seen.clone();
    registry.register_factory(MAPPER_ID, move |_: &Job, _: u32| -> Result<Arc<dyn Mapper>> {
        Ok(Arc::new(CountingMapper {
            seen: counter.clone(),
        }))
    })?;

    let queue = Arc::new(InMemoryTaskQueue::new("local"));
    let controller = Arc::new(
        Controller::new(Arc::new(InMemoryStore::new()), source, queue.clone(), registry)
            .with_config(ControllerConfig::from_reader(&env)?),
    );
    let mut worker = LocalWorker::new(queue, WorkerConfig::from_reader(&env)?);
    controller.install(&mut worker);

    let config = JobConfig::new(EntityQuery::kind(kind), MAPPER_ID, shards)
        .with_page_size(page_size)
        .with_pages_per_task(pages_per_task);
    let job_id = controller.launch_job(config).await?;

    let stats = worker.run_until_idle().await?;
    let info = controller.fetch_job_info(job_id).await?;
    tracing::info!(
        %job_id,
        state = %info.state,
        deliveries = stats.delivered,
        retried = stats.retried,
        mapped = seen.load(Ordering::Relaxed),
        "local run finished"
    );

    let json = serde_json::to_string_pretty(&info)
        .map_err(|e| Error::serialization(format!("job info: {e}")))?;
    println!("{json}");
    Ok(())
}
