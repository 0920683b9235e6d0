//! Task dispatch abstraction.
//!
//! This module provides:
//!
//! - [`TaskQueue`]: trait for enqueueing tasks to an execution backend
//! - [`InMemoryTaskQueue`](memory::InMemoryTaskQueue): in-process queue with a
//!   virtual clock, for tests and local runs
//! - [`LocalWorker`](worker::LocalWorker): delivery loop that drains an
//!   in-memory queue into registered handlers
//!
//! ## Delivery Contract
//!
//! - **At least once**: handlers must tolerate duplicates and late arrivals
//! - **Delays**: a task is not delivered before its delay has elapsed
//! - **Coalescing**: a task whose name matches a pending task is dropped

pub mod memory;
pub mod worker;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::task::TaskEnvelope;

/// Result of enqueuing a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Task was enqueued successfully.
    Enqueued {
        /// Queue-specific message ID.
        message_id: String,
    },
    /// A task with the same name is already pending.
    Deduplicated {
        /// The pending message ID.
        existing_message_id: String,
    },
    /// Queue is at capacity.
    QueueFull,
}

impl EnqueueResult {
    /// Returns true if the task was successfully enqueued.
    #[must_use]
    pub const fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued { .. })
    }

    /// Returns the message ID if the task is pending.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Enqueued { message_id }
            | Self::Deduplicated {
                existing_message_id: message_id,
            } => Some(message_id),
            Self::QueueFull => None,
        }
    }
}

/// Options for task enqueueing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Delay before the task becomes visible to workers.
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the delay before the task becomes visible.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Task queue abstraction.
///
/// All methods are `Send + Sync` so handlers can enqueue follow-up tasks
/// while other deliveries are in flight.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueues a task.
    ///
    /// # Returns
    ///
    /// - `EnqueueResult::Enqueued` with a message ID on success
    /// - `EnqueueResult::Deduplicated` if a same-named task is pending
    /// - `EnqueueResult::QueueFull` if the queue is at capacity
    async fn enqueue(&self, envelope: TaskEnvelope, options: EnqueueOptions) -> Result<EnqueueResult>;

    /// Enqueues multiple tasks in order.
    ///
    /// Default implementation calls `enqueue` for each task.
    async fn enqueue_batch(
        &self,
        tasks: Vec<(TaskEnvelope, EnqueueOptions)>,
    ) -> Result<Vec<EnqueueResult>> {
        let mut results = Vec::with_capacity(tasks.len());
        for (envelope, options) in tasks {
            results.push(self.enqueue(envelope, options).await?);
        }
        Ok(results)
    }

    /// Returns the approximate number of pending tasks.
    async fn queue_depth(&self) -> Result<usize>;

    /// Returns the queue's name.
    fn queue_name(&self) -> &str;
}
