//! Custom assertion helpers for integration tests.

use shardmap_core::KeyRange;
use shardmap_mapper::job::{JobInfo, JobState};
use shardmap_mapper::shard::{Shard, ShardState};

use crate::storage::StoreOp;

/// Asserts that a job completed successfully.
///
/// # Panics
///
/// Panics if the job did not succeed or any shard is not `SUCCESS`.
pub fn assert_job_succeeded(info: &JobInfo) {
    assert_eq!(
        info.state,
        JobState::Success,
        "Expected job to succeed, but state was {:?} (error: {:?})",
        info.state,
        info.error
    );
    for shard in &info.shards {
        assert_eq!(
            shard.state,
            ShardState::Success,
            "Expected shard {} to succeed, but state was {:?}",
            shard.index,
            shard.state
        );
    }
}

/// Asserts the job state.
///
/// # Panics
///
/// Panics if the state differs.
pub fn assert_job_state(info: &JobInfo, expected: JobState) {
    assert_eq!(
        info.state, expected,
        "Expected job {} to be {:?}, but state was {:?}",
        info.id, expected, info.state
    );
}

/// Asserts that every shard processed exactly its expected count.
///
/// # Panics
///
/// Panics on the first shard whose counts differ.
pub fn assert_shards_complete(shards: &[Shard]) {
    for shard in shards {
        assert_eq!(
            shard.processed_count, shard.expected_count,
            "Shard {} processed {} of {} entities",
            shard.id, shard.processed_count, shard.expected_count
        );
    }
}

/// Asserts that shard ranges are contiguous and cover `query`.
///
/// Shards must be ordered by index.
///
/// # Panics
///
/// Panics if the first shard does not start at the query start, if a gap or
/// overlap exists between neighbours, or if the last shard does not end at
/// the query end.
pub fn assert_ranges_partition(query: &KeyRange, shards: &[Shard]) {
    assert!(!shards.is_empty(), "Expected at least one shard");
    assert_eq!(
        shards[0].range.start, query.start,
        "First shard does not start at the query start"
    );
    for pair in shards.windows(2) {
        assert_eq!(
            pair[0].range.end, pair[1].range.start,
            "Shards {} and {} are not contiguous",
            pair[0].id, pair[1].id
        );
    }
    assert_eq!(
        shards[shards.len() - 1].range.end,
        query.end,
        "Last shard does not end at the query end"
    );
}

/// Asserts that the recorded writes never move a shard's processed count or
/// task number backwards.
///
/// # Panics
///
/// Panics on the first regression.
pub fn assert_progress_monotonic(writes: &[StoreOp]) {
    let mut last: Option<(u64, u32)> = None;
    for op in writes {
        if let StoreOp::CasShard {
            shard_id,
            processed_count,
            process_task_num,
            ..
        } = op
        {
            if let Some((count, task_num)) = last {
                assert!(
                    *processed_count >= count,
                    "Shard {shard_id} processed count went from {count} to {processed_count}"
                );
                assert!(
                    *process_task_num >= task_num,
                    "Shard {shard_id} task number went from {task_num} to {process_task_num}"
                );
            }
            last = Some((*processed_count, *process_task_num));
        }
    }
}
