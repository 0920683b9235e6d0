//! # shardmap-mapper
//!
//! Sharded mapper engine: runs user-supplied mappers over every entity key of
//! a kind, split into shards that are processed by at-least-once tasks.
//!
//! ## Core Concepts
//!
//! - **Job**: one run of a mapper over a key query, with an aggregate state
//! - **Shard**: a contiguous key sub-range of a job, processed in pages with a
//!   persisted resume cursor
//! - **Task**: a queued step (`SplitAndLaunch`, `FanOutShards`, `ProcessShard`,
//!   `UpdateJobState`) that reloads its state from the store when delivered
//!
//! ## Guarantees
//!
//! - **Restartable**: a shard resumes from its last checkpointed page
//! - **Duplicate-safe**: stale `ProcessShard` deliveries are ignored, and all
//!   record updates are compare-and-swap
//! - **Cooperative abort**: shards observe an abort at their next delivery
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use shardmap_core::Key;
//! use shardmap_mapper::prelude::*;
//!
//! struct Print;
//!
//! #[async_trait]
//! impl Mapper for Print {
//!     async fn map(&self, _ctx: &MapContext<'_>, keys: &[Key]) -> std::result::Result<(), MapperError> {
//!         println!("{} keys", keys.len());
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let registry = Arc::new(MapperRegistry::new());
//! registry.register_factory("print", |_: &Job, _: u32| -> Result<Arc<dyn Mapper>> {
//!     Ok(Arc::new(Print))
//! })?;
//!
//! let source = Arc::new(InMemoryEntities::new());
//! source.insert_ids("User", 1..=100)?;
//! let queue = Arc::new(InMemoryTaskQueue::new("local"));
//! let controller = Arc::new(Controller::new(
//!     Arc::new(InMemoryStore::new()),
//!     source,
//!     queue.clone(),
//!     registry,
//! ));
//!
//! let mut worker = LocalWorker::new(queue, WorkerConfig::default());
//! controller.install(&mut worker);
//!
//! let job_id = controller
//!     .launch_job(JobConfig::new(EntityQuery::kind("User"), "print", 4))
//!     .await?;
//! worker.run_until_idle().await?;
//! assert_eq!(controller.get_job(job_id).await?.state, JobState::Success);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod metrics;
pub mod registry;
pub mod shard;
pub mod source;
pub mod split;
pub mod store;
pub mod task;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{ControllerConfig, WorkerConfig};
    pub use crate::controller::Controller;
    pub use crate::dispatch::memory::InMemoryTaskQueue;
    pub use crate::dispatch::worker::{DeliveryStats, LocalWorker, TaskHandler};
    pub use crate::dispatch::{EnqueueOptions, EnqueueResult, TaskQueue};
    pub use crate::error::{Error, Result};
    pub use crate::job::{EntityQuery, Job, JobConfig, JobInfo, JobState, ShardInfo};
    pub use crate::registry::{MapContext, Mapper, MapperError, MapperFactory, MapperRegistry};
    pub use crate::shard::{Shard, ShardState};
    pub use crate::source::memory::InMemoryEntities;
    pub use crate::source::{EntitySource, KeyPage, KeysQuery};
    pub use crate::store::memory::InMemoryStore;
    pub use crate::store::{CasResult, MapperStore};
    pub use crate::task::{MapperTask, TaskEnvelope, TaskKind};
}
