//! Job controller.
//!
//! The [`Controller`] owns the public job API and the four task handlers that
//! move a job through its lifecycle:
//!
//! ```text
//! launch_job ─▶ SplitAndLaunch ─▶ FanOutShards ─▶ ProcessShard × N ─▶ UpdateJobState
//!                                                   │        ▲
//!                                                   └────────┘ next task_num
//! ```
//!
//! Handlers keep no state between deliveries. Every decision is made from
//! records in the [`MapperStore`], and every write is a CAS, so tasks can be
//! delivered more than once, late, or concurrently.
//!
//! ## Abort
//!
//! Abort is cooperative. `abort_job` only flips the job record; each
//! `ProcessShard` delivery checks the job once when it starts, so a shard
//! finishes its current task before it observes the abort.

use std::sync::Arc;

use async_trait::async_trait;

use shardmap_core::{JobId, ShardId};

use crate::config::ControllerConfig;
use crate::dispatch::worker::{LocalWorker, TaskHandler};
use crate::dispatch::{EnqueueOptions, EnqueueResult, TaskQueue};
use crate::error::{Error, Result};
use crate::job::{Job, JobConfig, JobInfo, JobState};
use crate::metrics::{time_task, MapperMetrics};
use crate::registry::{MapContext, Mapper, MapperRegistry};
use crate::shard::{Shard, ShardState};
use crate::source::{EntitySource, KeysQuery};
use crate::split::Splitter;
use crate::store::{checkpoint_shard, transact_job, transact_shard, MapperStore, TxOutcome};
use crate::task::{MapperTask, TaskEnvelope, TaskKind};

/// Drives mapper jobs.
pub struct Controller {
    store: Arc<dyn MapperStore>,
    source: Arc<dyn EntitySource>,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<MapperRegistry>,
    splitter: Splitter,
    config: ControllerConfig,
    metrics: MapperMetrics,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("queue", &self.queue.queue_name())
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a controller with the default configuration.
    #[must_use]
    pub fn new(
        store: Arc<dyn MapperStore>,
        source: Arc<dyn EntitySource>,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<MapperRegistry>,
    ) -> Self {
        let config = ControllerConfig::default();
        Self {
            splitter: Splitter::new(source.clone()).with_oversampling(config.oversampling),
            store,
            source,
            queue,
            registry,
            config,
            metrics: MapperMetrics::new(),
        }
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.splitter = self.splitter.with_oversampling(config.oversampling);
        self.config = config;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Installs this controller as the handler for every [`TaskKind`].
    pub fn install(self: &Arc<Self>, worker: &mut LocalWorker) {
        for kind in TaskKind::ALL {
            worker.install(kind, self.clone());
        }
    }

    // --- Job API ---

    /// Validates `config`, persists a `STARTING` job, and schedules its split.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if the config is rejected
    /// - [`Error::UnknownMapper`] if the mapper is not registered
    /// - storage or queue errors
    #[tracing::instrument(skip(self, config), fields(mapper_id = %config.mapper_id, kind = %config.query.kind))]
    pub async fn launch_job(&self, config: JobConfig) -> Result<JobId> {
        config.validate()?;
        self.registry.get(&config.mapper_id)?;

        let job_id = self.store.allocate_job_id().await?;
        let job = Job::new(job_id, config);
        self.store.insert_job(&job).await?;
        self.enqueue(MapperTask::SplitAndLaunch { job_id }, EnqueueOptions::default())
            .await?;

        tracing::info!(%job_id, shard_count = job.config.shard_count, "launched job");
        Ok(job_id)
    }

    /// Returns the job record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchJob`] if the job does not exist.
    pub async fn get_job(&self, job_id: JobId) -> Result<Job> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(Error::NoSuchJob { job_id })
    }

    /// Requests that a job stop.
    ///
    /// A job that has not started is aborted immediately; a running one moves
    /// to `ABORTING` and its shards stop at their next delivery. Calling this
    /// on an `ABORTING` job finalizes it if every shard has stopped. Terminal
    /// jobs are left alone. Returns the job state after the call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchJob`] if the job does not exist.
    #[tracing::instrument(skip(self))]
    pub async fn abort_job(&self, job_id: JobId) -> Result<JobState> {
        let shards = self.store.list_shards(job_id).await?;
        let (change, job) = transact_job(
            self.store.as_ref(),
            job_id,
            self.config.transaction_attempts,
            |job| {
                let from = job.state;
                let committed = match job.state {
                    JobState::Starting => {
                        job.transition_to(JobState::Aborted)?;
                        true
                    }
                    JobState::Running => {
                        job.transition_to(JobState::Aborting)?;
                        true
                    }
                    JobState::Aborting => job.finalize_from(&shards)?.is_some(),
                    JobState::Success | JobState::Fail | JobState::Aborted => false,
                };
                Ok(if committed {
                    TxOutcome::Commit(Some((from, job.state)))
                } else {
                    TxOutcome::Skip(None)
                })
            },
        )
        .await?;

        if let Some((from, to)) = change {
            self.metrics.record_job_transition(from.as_label(), to.as_label());
            tracing::info!(%job_id, %from, %to, "abort requested");
        }
        Ok(job.state)
    }

    /// Lists jobs, newest first.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        self.store.list_jobs(limit).await
    }

    /// Builds the read model for a job.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchJob`] if the job does not exist.
    pub async fn fetch_job_info(&self, job_id: JobId) -> Result<JobInfo> {
        self.get_job(job_id).await?.fetch_info(self.store.as_ref()).await
    }

    /// Returns a job's shards ordered by index.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn fetch_shards(&self, job_id: JobId) -> Result<Vec<Shard>> {
        self.store.list_shards(job_id).await
    }

    /// Loads a shard and checks that `expected_task_num` is current.
    ///
    /// # Errors
    ///
    /// - [`Error::ShardNotFound`] if the shard does not exist
    /// - [`Error::StaleTask`] if the shard has moved past `expected_task_num`
    /// - [`Error::TaskAhead`] if the shard has not reached it yet
    pub async fn get_active_shard(&self, shard_id: ShardId, expected_task_num: u32) -> Result<Shard> {
        let shard = self
            .store
            .get_shard(&shard_id)
            .await?
            .ok_or(Error::ShardNotFound { shard_id })?;
        let current = shard.process_task_num;
        if current > expected_task_num {
            return Err(Error::StaleTask {
                shard_id,
                task_num: expected_task_num,
                current,
            });
        }
        if current < expected_task_num {
            return Err(Error::TaskAhead {
                shard_id,
                task_num: expected_task_num,
                current,
            });
        }
        Ok(shard)
    }

    // --- Task handlers ---

    /// Splits a `STARTING` job into shards and moves it to `RUNNING`.
    ///
    /// Redelivery after the job has shards (`RUNNING`, or aborted after the
    /// split) only re-enqueues the fan-out, which is idempotent. Without it an
    /// abort that lands between the split and a failed fan-out enqueue would
    /// leave the job `ABORTING` forever.
    ///
    /// # Errors
    ///
    /// Returns storage, source, or queue errors.
    #[tracing::instrument(skip(self))]
    pub async fn split_and_launch(&self, job_id: JobId) -> Result<()> {
        let _timer = time_task(&self.metrics, TaskKind::SplitAndLaunch.as_label());
        let job = self.get_job(job_id).await?;
        match job.state {
            JobState::Starting => {}
            JobState::Running => {
                return self
                    .enqueue(MapperTask::FanOutShards { job_id }, EnqueueOptions::default())
                    .await;
            }
            JobState::Aborting | JobState::Aborted => {
                if self.store.list_shards(job_id).await?.is_empty() {
                    tracing::debug!(state = %job.state, "job aborted before splitting, ignoring");
                    return Ok(());
                }
                return self
                    .enqueue(MapperTask::FanOutShards { job_id }, EnqueueOptions::default())
                    .await;
            }
            state => {
                tracing::debug!(%state, "job is past splitting, ignoring");
                return Ok(());
            }
        }

        let mut shards = self.store.list_shards(job_id).await?;
        if shards.is_empty() {
            shards = self.plan_shards(&job).await?;
            let written = self.store.insert_shards(&shards).await?;
            tracing::info!(shards = shards.len(), written, "created shards");
        } else {
            tracing::debug!(shards = shards.len(), "reusing shards from an earlier delivery");
        }

        let (started, _) = transact_job(
            self.store.as_ref(),
            job_id,
            self.config.transaction_attempts,
            |job| {
                if job.state == JobState::Starting {
                    job.transition_to(JobState::Running)?;
                    Ok(TxOutcome::Commit(true))
                } else {
                    Ok(TxOutcome::Skip(job.state == JobState::Running))
                }
            },
        )
        .await?;

        if started {
            self.metrics.record_job_transition(
                JobState::Starting.as_label(),
                JobState::Running.as_label(),
            );
        }
        // An aborted job still fans out so its shards reach a terminal state.
        self.enqueue(MapperTask::FanOutShards { job_id }, EnqueueOptions::default())
            .await
    }

    async fn plan_shards(&self, job: &Job) -> Result<Vec<Shard>> {
        let query = &job.config.query;
        let ranges = self.splitter.split_query(query, job.config.shard_count).await?;
        let mut shards = Vec::with_capacity(ranges.len());
        for (index, piece) in ranges.into_iter().enumerate() {
            let index = u32::try_from(index)
                .map_err(|_| Error::invalid_config("split produced too many shards"))?;
            let expected = if job.config.track_progress {
                self.source.count(&query.kind, &piece.range).await?
            } else {
                piece.expected_count
            };
            shards.push(Shard::new(ShardId::new(job.id, index), piece.range, expected));
        }
        Ok(shards)
    }

    /// Enqueues the current process task of every `STARTING` shard.
    ///
    /// # Errors
    ///
    /// Returns storage or queue errors.
    #[tracing::instrument(skip(self))]
    pub async fn fan_out_shards(&self, job_id: JobId) -> Result<()> {
        let _timer = time_task(&self.metrics, TaskKind::FanOutShards.as_label());
        let shards = self.store.list_shards(job_id).await?;
        let tasks: Vec<(TaskEnvelope, EnqueueOptions)> = shards
            .iter()
            .filter(|shard| shard.state == ShardState::Starting)
            .map(|shard| {
                let task = MapperTask::ProcessShard {
                    shard_id: shard.id,
                    task_num: shard.process_task_num,
                };
                (TaskEnvelope::new(task), EnqueueOptions::default())
            })
            .collect();

        let count = tasks.len();
        for result in self.queue.enqueue_batch(tasks).await? {
            Self::check_enqueued(&result)?;
        }
        tracing::info!(shards = count, "fanned out shards");
        Ok(())
    }

    /// Maps up to `pages_per_task` pages of one shard.
    ///
    /// # Errors
    ///
    /// - [`Error::TaskAhead`] if the delivery raced ahead of the shard record
    /// - [`Error::Transient`] for transient mapper failures and write conflicts
    /// - [`Error::ShardNotFound`] or [`Error::NoSuchJob`] for missing records
    #[tracing::instrument(skip(self), fields(job_id = %shard_id.job_id, shard = shard_id.index))]
    pub async fn process_shard(&self, shard_id: ShardId, task_num: u32) -> Result<()> {
        let _timer = time_task(&self.metrics, TaskKind::ProcessShard.as_label());
        let job_id = shard_id.job_id;

        let mut shard = match self.get_active_shard(shard_id, task_num).await {
            Ok(shard) => shard,
            Err(Error::StaleTask { current, .. }) => {
                tracing::debug!(current, "stale delivery, ignoring");
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        if shard.is_terminal() {
            // A previous delivery finished the shard; make sure the job hears about it.
            return self.schedule_job_update(job_id).await;
        }

        let job = self.get_job(job_id).await?;
        let mut persisted = shard.state;

        if job.state.is_aborting() {
            return self.abort_shard(shard_id, task_num).await;
        }

        let mapper = match self
            .registry
            .get(&job.config.mapper_id)
            .and_then(|factory| factory.create(&job, shard_id.index))
        {
            Ok(mapper) => mapper,
            Err(error) => {
                shard.fail(format!("could not create mapper: {error}"))?;
                return self.finish_shard(&mut shard, &mut persisted).await;
            }
        };

        let page_size = job.config.page_size as usize;
        for _ in 0..job.config.pages_per_task {
            let query = KeysQuery {
                kind: job.config.query.kind.clone(),
                range: shard.range.clone(),
                start: shard.resume_from.clone(),
                limit: page_size,
            };
            let page = match self.source.query_keys(&query).await {
                Ok(page) => page,
                Err(error) if error.is_transient() => return Err(error),
                Err(error) => {
                    shard.fail(format!("while querying keys: {error}"))?;
                    return self.finish_shard(&mut shard, &mut persisted).await;
                }
            };

            let short = page.is_short(page_size);
            if !page.keys.is_empty() {
                let mapped = page.keys.len();
                if let Err(failure) = self.map_page(mapper.as_ref(), &job, &shard, &page.keys).await {
                    self.metrics
                        .record_mapper_error(job.config.mapper_id.as_str(), failure.is_transient());
                    if failure.is_transient() {
                        shard.transient_retries += 1;
                        self.save_shard(&mut shard, &mut persisted).await?;
                        return Err(Error::transient(format!(
                            "shard {shard_id}: while mapping {mapped} keys: {failure}"
                        )));
                    }
                    shard.fail(format!("while mapping {mapped} keys: {failure}"))?;
                    return self.finish_shard(&mut shard, &mut persisted).await;
                }
                self.metrics.record_page(job.config.mapper_id.as_str(), mapped);
                shard.record_page(mapped, page.cursor)?;
            }

            if short {
                shard.transition_to(ShardState::Success)?;
                return self.finish_shard(&mut shard, &mut persisted).await;
            }
            self.save_shard(&mut shard, &mut persisted).await?;
        }

        // Budget spent: hand the rest of the shard to the next task number.
        let next = task_num
            .checked_add(1)
            .ok_or_else(|| Error::InvalidStateTransition {
                from: shard.state.to_string(),
                to: shard.state.to_string(),
                reason: format!("shard {shard_id} exhausted its task numbers"),
            })?;
        self.enqueue(
            MapperTask::ProcessShard {
                shard_id,
                task_num: next,
            },
            EnqueueOptions::default(),
        )
        .await?;
        shard.process_task_num = next;
        self.save_shard(&mut shard, &mut persisted).await?;
        tracing::debug!(
            processed = shard.processed_count,
            next_task = next,
            "continuing shard in next task"
        );
        Ok(())
    }

    /// Moves an active shard of an aborting job to `ABORTED`.
    ///
    /// Re-reads the shard so a concurrent delivery that already finished it
    /// is left alone.
    async fn abort_shard(&self, shard_id: ShardId, task_num: u32) -> Result<()> {
        let (aborted, shard) = transact_shard(
            self.store.as_ref(),
            shard_id,
            self.config.transaction_attempts,
            |shard| {
                if shard.is_terminal() || shard.process_task_num != task_num {
                    return Ok(TxOutcome::Skip(None));
                }
                let from = shard.state;
                shard.transition_to(ShardState::Aborted)?;
                Ok(TxOutcome::Commit(Some(from)))
            },
        )
        .await?;

        match aborted {
            Some(from) => {
                self.metrics
                    .record_shard_transition(from.as_label(), ShardState::Aborted.as_label());
                tracing::info!(processed = shard.processed_count, "shard aborted");
            }
            None => tracing::debug!(state = %shard.state, "shard moved on before abort, skipping"),
        }
        self.schedule_job_update(shard_id.job_id).await
    }

    async fn map_page(
        &self,
        mapper: &dyn Mapper,
        job: &Job,
        shard: &Shard,
        keys: &[shardmap_core::Key],
    ) -> std::result::Result<(), crate::registry::MapperError> {
        let ctx = MapContext {
            job_id: job.id,
            shard_index: shard.index(),
            params: &job.config.params,
        };
        mapper.map(&ctx, keys).await
    }

    /// Aggregates shard states into a terminal job state.
    ///
    /// No-op while any shard is active or once the job is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchJob`] or storage errors.
    #[tracing::instrument(skip(self))]
    pub async fn update_job_state(&self, job_id: JobId) -> Result<()> {
        let _timer = time_task(&self.metrics, TaskKind::UpdateJobState.as_label());
        let shards = self.store.list_shards(job_id).await?;
        let (change, job) = transact_job(
            self.store.as_ref(),
            job_id,
            self.config.transaction_attempts,
            |job| {
                if job.is_terminal() || job.state == JobState::Starting {
                    return Ok(TxOutcome::Skip(None));
                }
                let from = job.state;
                Ok(match job.finalize_from(&shards)? {
                    Some(to) => TxOutcome::Commit(Some((from, to))),
                    None => TxOutcome::Skip(None),
                })
            },
        )
        .await?;

        match change {
            Some((from, to)) => {
                self.metrics.record_job_transition(from.as_label(), to.as_label());
                tracing::info!(%from, %to, error = job.error.as_deref(), "job finished");
            }
            None => tracing::debug!(state = %job.state, "job unchanged"),
        }
        Ok(())
    }

    // --- Helpers ---

    async fn save_shard(&self, shard: &mut Shard, persisted: &mut ShardState) -> Result<()> {
        checkpoint_shard(self.store.as_ref(), shard).await?;
        if shard.state != *persisted {
            self.metrics
                .record_shard_transition(persisted.as_label(), shard.state.as_label());
            *persisted = shard.state;
        }
        Ok(())
    }

    async fn finish_shard(&self, shard: &mut Shard, persisted: &mut ShardState) -> Result<()> {
        self.save_shard(shard, persisted).await?;
        match shard.state {
            ShardState::Fail => tracing::warn!(
                processed = shard.processed_count,
                error = shard.error.as_deref(),
                "shard failed"
            ),
            state => tracing::info!(processed = shard.processed_count, %state, "shard finished"),
        }
        self.schedule_job_update(shard.id.job_id).await
    }

    async fn schedule_job_update(&self, job_id: JobId) -> Result<()> {
        self.enqueue(
            MapperTask::UpdateJobState { job_id },
            EnqueueOptions::new().with_delay(self.config.update_job_state_delay),
        )
        .await
    }

    async fn enqueue(&self, task: MapperTask, options: EnqueueOptions) -> Result<()> {
        let result = self.queue.enqueue(TaskEnvelope::new(task), options).await?;
        Self::check_enqueued(&result)
    }

    fn check_enqueued(result: &EnqueueResult) -> Result<()> {
        match result {
            EnqueueResult::Enqueued { .. } | EnqueueResult::Deduplicated { .. } => Ok(()),
            EnqueueResult::QueueFull => Err(Error::transient("task queue is full")),
        }
    }
}

#[async_trait]
impl TaskHandler for Controller {
    async fn handle(&self, envelope: &TaskEnvelope) -> Result<()> {
        match envelope.task {
            MapperTask::SplitAndLaunch { job_id } => self.split_and_launch(job_id).await,
            MapperTask::FanOutShards { job_id } => self.fan_out_shards(job_id).await,
            MapperTask::ProcessShard { shard_id, task_num } => {
                self.process_shard(shard_id, task_num).await
            }
            MapperTask::UpdateJobState { job_id } => self.update_job_state(job_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::memory::InMemoryTaskQueue;
    use crate::job::EntityQuery;
    use crate::registry::MapperError;
    use crate::source::memory::InMemoryEntities;
    use crate::store::memory::InMemoryStore;
    use shardmap_core::Key;

    struct Noop;

    #[async_trait]
    impl Mapper for Noop {
        async fn map(&self, _ctx: &MapContext<'_>, _keys: &[Key]) -> std::result::Result<(), MapperError> {
            Ok(())
        }
    }

    struct Fixture {
        controller: Controller,
        store: Arc<InMemoryStore>,
        queue: Arc<InMemoryTaskQueue>,
    }

    fn fixture() -> Fixture {
        fixture_with_queue(InMemoryTaskQueue::new("test"))
    }

    fn fixture_with_queue(queue: InMemoryTaskQueue) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let source = Arc::new(InMemoryEntities::new());
        source.insert_ids("Item", 1..=20).unwrap();
        let queue = Arc::new(queue);
        let registry = Arc::new(MapperRegistry::new());
        registry
            .register_factory("noop", |_: &Job, _: u32| -> Result<Arc<dyn Mapper>> { Ok(Arc::new(Noop)) })
            .unwrap();
        let controller = Controller::new(store.clone(), source, queue.clone(), registry);
        Fixture {
            controller,
            store,
            queue,
        }
    }

    fn config(shards: u32) -> JobConfig {
        JobConfig::new(EntityQuery::kind("Item"), "noop", shards).with_page_size(5)
    }

    #[tokio::test]
    async fn launch_persists_starting_job_and_enqueues_split() -> Result<()> {
        let f = fixture();
        let job_id = f.controller.launch_job(config(2)).await?;

        let job = f.controller.get_job(job_id).await?;
        assert_eq!(job.state, JobState::Starting);
        let pending: Vec<String> = f.queue.pending()?.into_iter().map(|e| e.name).collect();
        assert_eq!(pending, vec![format!("split-{job_id}")]);
        Ok(())
    }

    #[tokio::test]
    async fn launch_rejects_unknown_mapper_and_bad_config() {
        let f = fixture();
        let unknown = JobConfig::new(EntityQuery::kind("Item"), "missing", 2);
        assert!(matches!(
            f.controller.launch_job(unknown).await,
            Err(Error::UnknownMapper { .. })
        ));
        assert!(matches!(
            f.controller.launch_job(config(0)).await,
            Err(Error::InvalidConfig { .. })
        ));
        assert_eq!(f.store.job_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn get_job_reports_missing_job() {
        let f = fixture();
        assert!(matches!(
            f.controller.get_job(JobId::new(42)).await,
            Err(Error::NoSuchJob { .. })
        ));
    }

    #[tokio::test]
    async fn abort_before_split_is_immediate() -> Result<()> {
        let f = fixture();
        let job_id = f.controller.launch_job(config(2)).await?;
        assert_eq!(f.controller.abort_job(job_id).await?, JobState::Aborted);

        // The pending split is now a no-op.
        f.controller.split_and_launch(job_id).await?;
        assert!(f.controller.fetch_shards(job_id).await?.is_empty());
        assert_eq!(f.controller.get_job(job_id).await?.state, JobState::Aborted);
        Ok(())
    }

    #[tokio::test]
    async fn split_creates_shards_and_starts_job() -> Result<()> {
        let f = fixture();
        let job_id = f.controller.launch_job(config(2)).await?;
        f.queue.take()?;
        f.controller.split_and_launch(job_id).await?;

        let shards = f.controller.fetch_shards(job_id).await?;
        assert_eq!(shards.len(), 2);
        assert_eq!(shards.iter().map(|s| s.expected_count).sum::<u64>(), 20);
        assert_eq!(f.controller.get_job(job_id).await?.state, JobState::Running);

        // Redelivery keeps the same shards.
        f.controller.split_and_launch(job_id).await?;
        assert_eq!(f.controller.fetch_shards(job_id).await?, shards);
        Ok(())
    }

    #[tokio::test]
    async fn active_shard_checks_task_number() -> Result<()> {
        let f = fixture();
        let job_id = JobId::new(1);
        let mut shard = Shard::new(ShardId::new(job_id, 0), shardmap_core::KeyRange::unbounded(), 0);
        shard.process_task_num = 2;
        f.store.insert_shards(&[shard]).await?;
        let id = ShardId::new(job_id, 0);

        assert!(f.controller.get_active_shard(id, 2).await.is_ok());
        assert!(matches!(
            f.controller.get_active_shard(id, 1).await,
            Err(Error::StaleTask { current: 2, .. })
        ));
        let ahead = f.controller.get_active_shard(id, 3).await.unwrap_err();
        assert!(matches!(ahead, Error::TaskAhead { .. }));
        assert!(ahead.is_transient());
        assert!(matches!(
            f.controller.get_active_shard(ShardId::new(job_id, 9), 0).await,
            Err(Error::ShardNotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn update_waits_for_active_shards() -> Result<()> {
        let f = fixture();
        let job_id = f.controller.launch_job(config(1)).await?;
        f.controller.split_and_launch(job_id).await?;

        f.controller.update_job_state(job_id).await?;
        assert_eq!(f.controller.get_job(job_id).await?.state, JobState::Running);
        Ok(())
    }

    #[tokio::test]
    async fn abort_after_failed_fan_out_still_stops_shards() -> Result<()> {
        let f = fixture_with_queue(InMemoryTaskQueue::with_capacity("test", 1));
        let job_id = f.controller.launch_job(config(1)).await?;

        // The split is still pending, so the fan-out does not fit.
        let err = f.controller.split_and_launch(job_id).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(f.controller.get_job(job_id).await?.state, JobState::Running);
        assert_eq!(f.controller.fetch_shards(job_id).await?.len(), 1);

        assert_eq!(f.controller.abort_job(job_id).await?, JobState::Aborting);

        // Redeliver the split, then drain by hand.
        let mut delivered = Vec::new();
        while let Some(entry) = f.queue.take()? {
            delivered.push(entry.envelope.kind());
            f.controller.handle(&entry.envelope).await?;
        }
        assert_eq!(
            delivered,
            vec![
                TaskKind::SplitAndLaunch,
                TaskKind::FanOutShards,
                TaskKind::ProcessShard,
                TaskKind::UpdateJobState,
            ]
        );
        assert_eq!(f.controller.get_job(job_id).await?.state, JobState::Aborted);
        for shard in f.controller.fetch_shards(job_id).await? {
            assert_eq!(shard.state, ShardState::Aborted);
        }
        Ok(())
    }

    #[tokio::test]
    async fn abort_applies_only_to_the_current_task() -> Result<()> {
        let f = fixture();
        let job_id = f.controller.launch_job(config(1)).await?;
        f.controller.split_and_launch(job_id).await?;
        assert_eq!(f.controller.abort_job(job_id).await?, JobState::Aborting);

        let id = ShardId::new(job_id, 0);
        let mut shard = f.store.get_shard(&id).await?.unwrap();
        shard.process_task_num = 1;
        assert!(f.store.cas_shard(&shard).await?.is_success());

        // The old delivery is stale and the current one aborts.
        f.controller.process_shard(id, 0).await?;
        assert_eq!(f.store.get_shard(&id).await?.unwrap().state, ShardState::Starting);
        f.controller.process_shard(id, 1).await?;
        assert_eq!(f.store.get_shard(&id).await?.unwrap().state, ShardState::Aborted);
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_task_numbers_are_rejected() -> Result<()> {
        let f = fixture();
        let job_id = f.controller.launch_job(config(1).with_pages_per_task(1)).await?;
        f.controller.split_and_launch(job_id).await?;

        let id = ShardId::new(job_id, 0);
        let mut shard = f.store.get_shard(&id).await?.unwrap();
        shard.process_task_num = u32::MAX;
        assert!(f.store.cas_shard(&shard).await?.is_success());

        let err = f.controller.process_shard(id, u32::MAX).await.unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }), "{err}");
        assert!(!err.is_transient());
        assert_eq!(f.store.get_shard(&id).await?.unwrap().process_task_num, u32::MAX);
        Ok(())
    }
}
