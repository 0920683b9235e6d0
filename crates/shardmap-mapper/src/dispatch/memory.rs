//! In-memory task queue implementation.
//!
//! This module provides [`InMemoryTaskQueue`], an in-process implementation of
//! the [`TaskQueue`] trait used by tests and the local runner.
//!
//! ## Virtual Time
//!
//! The queue keeps its own clock. A delayed task is due at `clock + delay`;
//! [`InMemoryTaskQueue::take`] returns the earliest due task and advances the
//! clock to its due time, so delays order deliveries without sleeping. Tasks
//! due at the same time are delivered in enqueue order.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no persistence, no distribution
//! - **Deduplication is queue-scoped**: names are released when tasks are taken

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use ulid::Ulid;

use super::{EnqueueOptions, EnqueueResult, TaskQueue};
use crate::error::{Error, Result};
use crate::task::TaskEnvelope;

/// Entry in the in-memory queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Message ID.
    pub message_id: String,
    /// Task name used for deduplication.
    pub name: String,
    /// Task envelope.
    pub envelope: TaskEnvelope,
    /// Virtual time at which the task becomes due.
    pub due: Duration,
}

/// Internal queue state protected by a single lock.
#[derive(Debug, Default)]
struct QueueState {
    clock: Duration,
    seq: u64,
    pending: BTreeMap<(Duration, u64), QueueEntry>,
    names: HashMap<String, String>,
}

/// In-memory task queue.
///
/// ## Example
///
/// ```rust
/// use shardmap_mapper::dispatch::memory::InMemoryTaskQueue;
///
/// let queue = InMemoryTaskQueue::new("local");
/// assert!(queue.take().unwrap().is_none());
/// ```
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    name: String,
    state: RwLock<QueueState>,
    max_capacity: Option<usize>,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("task queue lock poisoned")
}

impl InMemoryTaskQueue {
    /// Creates an unbounded queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(QueueState::default()),
            max_capacity: None,
        }
    }

    /// Creates a queue that rejects tasks beyond `max_capacity` pending ones.
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, max_capacity: usize) -> Self {
        Self {
            max_capacity: Some(max_capacity),
            ..Self::new(name)
        }
    }

    /// Removes and returns the earliest due task, advancing the clock to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn take(&self) -> Result<Option<QueueEntry>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let entry = state.pending.pop_first().map(|(_, entry)| entry);
        if let Some(ref entry) = entry {
            state.names.remove(&entry.name);
            state.clock = state.clock.max(entry.due);
        }
        drop(state);
        Ok(entry)
    }

    /// Returns how long after the current clock the next task is due.
    ///
    /// `None` when the queue is empty; zero when a task is already due.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn next_due_in(&self) -> Result<Option<Duration>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .pending
            .values()
            .next()
            .map(|entry| entry.due.saturating_sub(state.clock)))
    }

    /// Returns the pending tasks in delivery order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn pending(&self) -> Result<Vec<QueueEntry>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.pending.values().cloned().collect())
    }

    /// Returns the virtual clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn now(&self) -> Result<Duration> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.clock)
    }

    /// Drops every pending task.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.pending.clear();
        state.names.clear();
        drop(state);
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, envelope: TaskEnvelope, options: EnqueueOptions) -> Result<EnqueueResult> {
        let name = envelope.name();
        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(existing) = state.names.get(&name) {
            let existing_message_id = existing.clone();
            drop(state);
            tracing::debug!(task = %name, "coalesced duplicate task");
            return Ok(EnqueueResult::Deduplicated { existing_message_id });
        }

        if self.max_capacity.is_some_and(|max| state.pending.len() >= max) {
            drop(state);
            return Ok(EnqueueResult::QueueFull);
        }

        let message_id = Ulid::new().to_string();
        let due = state.clock + options.delay.unwrap_or_default();
        let seq = state.seq;
        state.seq += 1;
        state.names.insert(name.clone(), message_id.clone());
        state.pending.insert(
            (due, seq),
            QueueEntry {
                message_id: message_id.clone(),
                name,
                envelope,
                due,
            },
        );
        drop(state);

        Ok(EnqueueResult::Enqueued { message_id })
    }

    async fn queue_depth(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.pending.len())
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::MapperTask;
    use shardmap_core::JobId;

    fn envelope(task: MapperTask) -> TaskEnvelope {
        TaskEnvelope::new(task)
    }

    fn split(id: u64) -> TaskEnvelope {
        envelope(MapperTask::SplitAndLaunch { job_id: JobId::new(id) })
    }

    #[tokio::test]
    async fn enqueue_and_take() -> Result<()> {
        let queue = InMemoryTaskQueue::new("test");
        assert!(queue.enqueue(split(1), EnqueueOptions::default()).await?.is_enqueued());

        let entry = queue.take()?.expect("should have entry");
        assert_eq!(entry.name, "split-1");
        assert!(queue.take()?.is_none());

        // Name is released after take.
        assert!(queue.enqueue(split(1), EnqueueOptions::default()).await?.is_enqueued());
        Ok(())
    }

    #[tokio::test]
    async fn pending_duplicates_are_coalesced() -> Result<()> {
        let queue = InMemoryTaskQueue::new("test");
        let first = queue.enqueue(split(1), EnqueueOptions::default()).await?;
        let second = queue.enqueue(split(1), EnqueueOptions::default()).await?;

        assert_eq!(
            second,
            EnqueueResult::Deduplicated {
                existing_message_id: first.message_id().unwrap().to_string()
            }
        );
        assert_eq!(queue.queue_depth().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn delayed_tasks_are_delivered_after_immediate_ones() -> Result<()> {
        let queue = InMemoryTaskQueue::new("test");
        let delayed = envelope(MapperTask::UpdateJobState { job_id: JobId::new(1) });
        queue
            .enqueue(delayed, EnqueueOptions::new().with_delay(Duration::from_secs(2)))
            .await?;
        queue.enqueue(split(2), EnqueueOptions::default()).await?;
        queue.enqueue(split(3), EnqueueOptions::default()).await?;

        let order: Vec<String> = std::iter::from_fn(|| queue.take().ok().flatten())
            .map(|entry| entry.name)
            .collect();
        assert_eq!(order, vec!["split-2", "split-3", "update-1"]);
        assert_eq!(queue.now()?, Duration::from_secs(2));
        Ok(())
    }

    #[tokio::test]
    async fn delay_is_relative_to_virtual_clock() -> Result<()> {
        let queue = InMemoryTaskQueue::new("test");
        queue
            .enqueue(split(1), EnqueueOptions::new().with_delay(Duration::from_secs(5)))
            .await?;
        assert_eq!(queue.next_due_in()?, Some(Duration::from_secs(5)));
        queue.take()?;

        queue
            .enqueue(split(2), EnqueueOptions::new().with_delay(Duration::from_secs(1)))
            .await?;
        let entry = queue.take()?.expect("entry");
        assert_eq!(entry.due, Duration::from_secs(6));
        Ok(())
    }

    #[tokio::test]
    async fn capacity_is_enforced() -> Result<()> {
        let queue = InMemoryTaskQueue::with_capacity("test", 1);
        queue.enqueue(split(1), EnqueueOptions::default()).await?;
        assert_eq!(
            queue.enqueue(split(2), EnqueueOptions::default()).await?,
            EnqueueResult::QueueFull
        );
        queue.clear()?;
        assert_eq!(queue.queue_depth().await?, 0);
        Ok(())
    }
}
