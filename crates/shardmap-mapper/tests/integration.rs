//! End-to-end tests: launch jobs and drive them through the local worker.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;

use shardmap_core::{JobId, Key, ShardId};
use shardmap_mapper::controller::Controller;
use shardmap_mapper::dispatch::worker::DeliveryOutcome;
use shardmap_mapper::dispatch::{EnqueueOptions, TaskQueue};
use shardmap_mapper::error::{Error, Result};
use shardmap_mapper::job::{Job, JobState};
use shardmap_mapper::registry::{MapContext, Mapper, MapperError};
use shardmap_mapper::shard::ShardState;
use shardmap_mapper::task::{MapperTask, TaskEnvelope, TaskKind};
use shardmap_test_utils::{
    assert_job_state, assert_job_succeeded, assert_ranges_partition, assert_shards_complete,
    init_test_logging, job_config, MapperScript, TestHarness, TracingStore,
};

fn counting_harness(entities: i64) -> (TestHarness, Arc<MapperScript>) {
    init_test_logging();
    let harness = TestHarness::new();
    harness.seed("Item", entities);
    let script = MapperScript::new();
    harness.register("count", script.factory());
    (harness, script)
}

#[tokio::test]
async fn job_maps_every_entity_once() {
    let (harness, script) = counting_harness(512);
    let config = job_config("Item", "count", 4)
        .with_page_size(33)
        .with_pages_per_task(2);
    let query = config.query.range.clone();

    let job_id = harness.launch(config).await;
    let stats = harness.run().await;

    let info = harness.info(job_id).await;
    assert_job_succeeded(&info);
    assert_eq!(info.total_entities, 512);
    assert_eq!(info.processed_entities, 512);
    assert!(!stats.truncated);
    assert_eq!(stats.failed, 0);

    let shards = harness.shards(job_id).await;
    assert_eq!(shards.len(), 4);
    assert_ranges_partition(&query, &shards);
    assert_shards_complete(&shards);
    for shard in &shards {
        assert_eq!(script.keys(shard.index()), shard.expected_count);
    }
    assert_eq!(script.total_keys(), 512);
}

#[tokio::test]
async fn mapper_failure_fails_shard_and_job() {
    let (harness, script) = counting_harness(512);
    script.fail_on(1, 2, MapperError::fatal("boom"));

    let job_id = harness
        .launch(
            job_config("Item", "count", 4)
                .with_page_size(33)
                .with_pages_per_task(2),
        )
        .await;
    harness.run().await;

    let info = harness.info(job_id).await;
    assert_job_state(&info, JobState::Fail);
    assert_eq!(
        info.error.as_deref(),
        Some("shard 1: while mapping 33 keys: boom")
    );

    let shards = harness.shards(job_id).await;
    let failed = &shards[1];
    assert_eq!(failed.state, ShardState::Fail);
    assert_eq!(failed.error.as_deref(), Some("while mapping 33 keys: boom"));
    assert_eq!(failed.processed_count, 33);
    for shard in shards.iter().filter(|s| s.index() != 1) {
        assert_eq!(shard.state, ShardState::Success);
        assert_eq!(shard.processed_count, shard.expected_count);
    }
    assert_eq!(info.processed_entities, 512 - (failed.expected_count - 33));
}

#[tokio::test]
async fn transient_mapper_failure_resumes_from_checkpoint() {
    let (harness, script) = counting_harness(100);
    script.fail_on(0, 2, MapperError::transient("flaky"));

    let job_id = harness
        .launch(job_config("Item", "count", 1).with_page_size(33))
        .await;

    let split = harness.step().await.expect("split delivered");
    assert_eq!(split.kind, TaskKind::SplitAndLaunch);
    let fan_out = harness.step().await.expect("fan-out delivered");
    assert_eq!(fan_out.kind, TaskKind::FanOutShards);
    let process = harness.step().await.expect("process delivered");
    assert_eq!(process.kind, TaskKind::ProcessShard);
    assert_eq!(process.outcome, DeliveryOutcome::Retried);

    let shard = &harness.shards(job_id).await[0];
    assert_eq!(shard.state, ShardState::Running);
    assert_eq!(shard.processed_count, 33);
    assert!(shard.resume_from.is_some());
    assert_eq!(shard.process_task_num, 0);
    assert_eq!(shard.transient_retries, 1);

    harness.run().await;

    assert_job_succeeded(&harness.info(job_id).await);
    let shard = &harness.shards(job_id).await[0];
    assert_eq!(shard.processed_count, 100);
    assert_eq!(script.keys(0), 100);
    assert_eq!(script.calls(0), 5);
}

#[tokio::test]
async fn lost_checkpoint_remaps_page_without_double_counting() {
    init_test_logging();
    let store = TracingStore::new();
    let harness = TestHarness::with_store(Arc::new(store.clone()));
    harness.seed("Item", 100);
    let script = MapperScript::new();
    harness.register("count", script.factory());

    let job_id = harness
        .launch(job_config("Item", "count", 1).with_page_size(33))
        .await;
    harness.step().await;
    harness.step().await;

    store.fail_next_shard_writes(1);
    let process = harness.step().await.expect("process delivered");
    assert_eq!(process.outcome, DeliveryOutcome::Retried);
    assert_eq!(harness.shards(job_id).await[0].processed_count, 0);

    harness.run().await;

    assert_job_succeeded(&harness.info(job_id).await);
    assert_eq!(harness.shards(job_id).await[0].processed_count, 100);
    // The first page reached the mapper twice.
    assert_eq!(script.total_keys(), 133);
}

#[tokio::test]
async fn mapper_factory_failure_fails_shard() {
    init_test_logging();
    let harness = TestHarness::new();
    harness.seed("Item", 10);
    harness.register("broken", |_: &Job, _: u32| -> Result<Arc<dyn Mapper>> {
        Err(Error::invalid_config("missing credentials"))
    });

    let job_id = harness.launch(job_config("Item", "broken", 1)).await;
    harness.run().await;

    let info = harness.info(job_id).await;
    assert_job_state(&info, JobState::Fail);
    let shard = &harness.shards(job_id).await[0];
    assert_eq!(shard.state, ShardState::Fail);
    let error = shard.error.as_deref().unwrap();
    assert!(error.starts_with("could not create mapper: "), "{error}");
    assert!(error.contains("missing credentials"), "{error}");
}

#[tokio::test]
async fn empty_kind_succeeds_with_single_shard() {
    let (harness, script) = counting_harness(10);

    let job_id = harness.launch(job_config("Nothing", "count", 4)).await;
    harness.run().await;

    let info = harness.info(job_id).await;
    assert_job_succeeded(&info);
    assert_eq!(info.shards.len(), 1);
    assert_eq!(info.total_entities, 0);
    assert_eq!(script.calls(0), 0);
}

struct AbortOnFirstPage {
    controller: Arc<OnceLock<Weak<Controller>>>,
    fired: Arc<AtomicBool>,
}

#[async_trait]
impl Mapper for AbortOnFirstPage {
    async fn map(&self, ctx: &MapContext<'_>, _keys: &[Key]) -> std::result::Result<(), MapperError> {
        if ctx.shard_index == 0 && !self.fired.swap(true, Ordering::SeqCst) {
            let controller = self
                .controller
                .get()
                .and_then(Weak::upgrade)
                .ok_or_else(|| MapperError::fatal("controller dropped"))?;
            controller.abort_job(ctx.job_id).await?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn abort_during_processing_stops_every_shard() {
    init_test_logging();
    let harness = TestHarness::new();
    harness.seed("Item", 512);
    let slot: Arc<OnceLock<Weak<Controller>>> = Arc::new(OnceLock::new());
    slot.set(Arc::downgrade(&harness.controller)).unwrap();
    let fired = Arc::new(AtomicBool::new(false));
    harness.register("abort", move |_: &Job, _: u32| -> Result<Arc<dyn Mapper>> {
        Ok(Arc::new(AbortOnFirstPage {
            controller: slot.clone(),
            fired: fired.clone(),
        }))
    });

    let job_id = harness
        .launch(
            job_config("Item", "abort", 4)
                .with_page_size(33)
                .with_pages_per_task(2),
        )
        .await;
    harness.run().await;

    let info = harness.info(job_id).await;
    assert_job_state(&info, JobState::Aborted);
    let shards = harness.shards(job_id).await;
    assert!(shards.iter().all(|s| s.state == ShardState::Aborted));
    // The aborting shard finishes its current task before observing the abort.
    assert_eq!(shards[0].processed_count, 66);
    assert!(shards[1..].iter().all(|s| s.processed_count == 0));
}

fn pending_names(harness: &TestHarness) -> Vec<String> {
    harness
        .queue
        .pending()
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect()
}

#[tokio::test]
async fn abort_before_split_is_immediate_and_idempotent() {
    let (harness, script) = counting_harness(50);
    let job_id = harness.launch(job_config("Item", "count", 2)).await;

    assert_eq!(harness.controller.abort_job(job_id).await.unwrap(), JobState::Aborted);
    let queued = pending_names(&harness);
    assert_eq!(harness.controller.abort_job(job_id).await.unwrap(), JobState::Aborted);
    assert_eq!(pending_names(&harness), queued);
    harness.run().await;

    assert_job_state(&harness.info(job_id).await, JobState::Aborted);
    assert!(harness.shards(job_id).await.is_empty());
    assert_eq!(script.total_keys(), 0);
}

#[tokio::test]
async fn abort_of_running_job_waits_for_shards() {
    let (harness, script) = counting_harness(50);
    let job_id = harness.launch(job_config("Item", "count", 2)).await;
    harness.step().await;
    harness.step().await;
    assert_eq!(harness.job(job_id).await.state, JobState::Running);

    let controller = &harness.controller;
    assert_eq!(controller.abort_job(job_id).await.unwrap(), JobState::Aborting);
    let queued = pending_names(&harness);
    assert_eq!(controller.abort_job(job_id).await.unwrap(), JobState::Aborting);
    assert_eq!(pending_names(&harness), queued);

    harness.run().await;

    assert_eq!(controller.abort_job(job_id).await.unwrap(), JobState::Aborted);
    let shards = harness.shards(job_id).await;
    assert!(shards.iter().all(|s| s.state == ShardState::Aborted));
    assert_eq!(script.total_keys(), 0);
}

#[tokio::test]
async fn abort_of_finished_job_is_a_no_op() {
    let (harness, _script) = counting_harness(20);
    let job_id = harness.launch(job_config("Item", "count", 2)).await;
    harness.run().await;

    assert_eq!(harness.controller.abort_job(job_id).await.unwrap(), JobState::Success);
    assert!(matches!(
        harness.controller.abort_job(JobId::new(999)).await,
        Err(Error::NoSuchJob { .. })
    ));
}

#[tokio::test]
async fn stale_and_early_deliveries_are_handled() {
    let (harness, script) = counting_harness(100);
    let job_id = harness
        .launch(
            job_config("Item", "count", 1)
                .with_page_size(10)
                .with_pages_per_task(2),
        )
        .await;
    harness.run().await;

    let shard_id = ShardId::new(job_id, 0);
    let before = harness.shards(job_id).await[0].clone();
    assert_eq!(before.process_task_num, 5);

    harness.controller.process_shard(shard_id, 0).await.unwrap();
    assert_eq!(harness.shards(job_id).await[0], before);

    let early = harness.controller.process_shard(shard_id, 9).await.unwrap_err();
    assert!(matches!(early, Error::TaskAhead { .. }));
    assert!(early.is_transient());

    let stale = TaskEnvelope::new(MapperTask::ProcessShard {
        shard_id,
        task_num: 1,
    });
    harness
        .queue
        .enqueue(stale, EnqueueOptions::default())
        .await
        .unwrap();
    let delivery = harness.step().await.expect("stale task delivered");
    assert_eq!(delivery.outcome, DeliveryOutcome::Acked);

    assert_eq!(harness.shards(job_id).await[0], before);
    assert_eq!(script.total_keys(), 100);
}

#[tokio::test]
async fn list_jobs_returns_newest_first() {
    let (harness, _script) = counting_harness(5);
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(harness.launch(job_config("Item", "count", 1)).await);
    }

    let listed: Vec<JobId> = harness
        .controller
        .list_jobs(2)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(listed, vec![ids[2], ids[1]]);
}
