//! Local delivery loop.
//!
//! [`LocalWorker`] pops tasks from an [`InMemoryTaskQueue`] and routes them to
//! the [`TaskHandler`] installed for their [`TaskKind`]. It applies the
//! delivery policy a hosted queue would:
//!
//! - `Ok` acknowledges the task
//! - a transient error redelivers the task after `retry_delay`, up to
//!   `max_attempts` deliveries
//! - any other error is logged and the task is acknowledged

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use shardmap_core::observability::{job_span, shard_span};
use tracing::Instrument;

use super::memory::InMemoryTaskQueue;
use super::{EnqueueOptions, TaskQueue};
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::metrics::MapperMetrics;
use crate::task::{MapperTask, TaskEnvelope, TaskKind};

/// Executes delivered tasks.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Handles one delivery.
    ///
    /// # Errors
    ///
    /// Transient errors ask for redelivery; other errors are final.
    async fn handle(&self, envelope: &TaskEnvelope) -> Result<()>;
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler succeeded.
    Acked,
    /// Transient failure; the task was re-enqueued.
    Retried,
    /// Non-transient failure; the task was dropped.
    Failed,
    /// Transient failure on the last allowed attempt; the task was dropped.
    DeadLettered,
}

impl DeliveryOutcome {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::Retried => "retried",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// Record of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Task name.
    pub name: String,
    /// Task kind.
    pub kind: TaskKind,
    /// Attempt number of this delivery.
    pub attempt: u32,
    /// Outcome.
    pub outcome: DeliveryOutcome,
}

/// Counters for a run of the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Deliveries made.
    pub delivered: u64,
    /// Deliveries acknowledged after success.
    pub acked: u64,
    /// Deliveries that were re-enqueued.
    pub retried: u64,
    /// Deliveries dropped after a non-transient error.
    pub failed: u64,
    /// Deliveries dropped after exhausting their attempts.
    pub dead_lettered: u64,
    /// True if the run stopped at `max_deliveries` with tasks still pending.
    pub truncated: bool,
}

impl DeliveryStats {
    fn record(&mut self, delivery: &Delivery) {
        self.delivered += 1;
        match delivery.outcome {
            DeliveryOutcome::Acked => self.acked += 1,
            DeliveryOutcome::Retried => self.retried += 1,
            DeliveryOutcome::Failed => self.failed += 1,
            DeliveryOutcome::DeadLettered => self.dead_lettered += 1,
        }
    }
}

/// Single-process worker draining an [`InMemoryTaskQueue`].
pub struct LocalWorker {
    queue: Arc<InMemoryTaskQueue>,
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
    config: WorkerConfig,
    metrics: MapperMetrics,
}

impl std::fmt::Debug for LocalWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&TaskKind> = self.handlers.keys().collect();
        kinds.sort();
        f.debug_struct("LocalWorker")
            .field("queue", &self.queue.queue_name())
            .field("handlers", &kinds)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LocalWorker {
    /// Creates a worker with no handlers installed.
    #[must_use]
    pub fn new(queue: Arc<InMemoryTaskQueue>, config: WorkerConfig) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            config,
            metrics: MapperMetrics::new(),
        }
    }

    /// Installs `handler` for tasks of `kind`, replacing any previous one.
    pub fn install(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Returns true if a handler is installed for `kind`.
    #[must_use]
    pub fn handles(&self, kind: TaskKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// The queue this worker drains.
    #[must_use]
    pub const fn queue(&self) -> &Arc<InMemoryTaskQueue> {
        &self.queue
    }

    /// Delivers the next due task, if any.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue itself fails; handler errors are
    /// turned into a [`DeliveryOutcome`].
    pub async fn run_once(&self) -> Result<Option<Delivery>> {
        if self.config.real_time {
            if let Some(wait) = self.queue.next_due_in()? {
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
        }

        let Some(entry) = self.queue.take()? else {
            return Ok(None);
        };
        let envelope = entry.envelope;
        let kind = envelope.kind();
        let span = match &envelope.task {
            MapperTask::ProcessShard { shard_id, .. } => shard_span(kind.as_label(), *shard_id),
            task => job_span(kind.as_label(), task.job_id()),
        };
        span.in_scope(|| tracing::debug!(task = %entry.name, attempt = envelope.attempt, "delivering"));

        let result = match self.handlers.get(&kind) {
            Some(handler) => handler.handle(&envelope).instrument(span.clone()).await,
            None => Err(Error::invalid_config(format!("no handler installed for {kind}"))),
        };

        let outcome = match result {
            Ok(()) => DeliveryOutcome::Acked,
            Err(error) if error.is_transient() => {
                if envelope.attempt < self.config.max_attempts {
                    span.in_scope(|| tracing::warn!(%error, "transient failure, redelivering"));
                    self.queue
                        .enqueue(
                            envelope.next_attempt(),
                            EnqueueOptions::new().with_delay(self.config.retry_delay),
                        )
                        .await?;
                    DeliveryOutcome::Retried
                } else {
                    span.in_scope(|| tracing::error!(%error, "giving up after final attempt"));
                    DeliveryOutcome::DeadLettered
                }
            }
            Err(error) => {
                span.in_scope(|| tracing::error!(%error, "task failed, acknowledging"));
                DeliveryOutcome::Failed
            }
        };

        self.metrics.record_delivery(kind.as_label(), outcome.as_label());
        Ok(Some(Delivery {
            name: entry.name,
            kind,
            attempt: envelope.attempt,
            outcome,
        }))
    }

    /// Delivers tasks until the queue is empty or `max_deliveries` is reached.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue fails.
    pub async fn run_until_idle(&self) -> Result<DeliveryStats> {
        let mut stats = DeliveryStats::default();
        loop {
            if stats.delivered >= self.config.max_deliveries {
                stats.truncated = self.queue.queue_depth().await? > 0;
                if stats.truncated {
                    tracing::warn!(
                        delivered = stats.delivered,
                        "stopping with tasks still pending"
                    );
                }
                break;
            }
            let Some(delivery) = self.run_once().await? else {
                break;
            };
            stats.record(&delivery);
        }
        self.metrics
            .set_queue_depth(self.queue.queue_name(), self.queue.queue_depth().await?);
        tracing::debug!(?stats, "worker idle");
        Ok(stats)
    }
}
