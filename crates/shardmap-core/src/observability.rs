//! Logging setup and span helpers.
//!
//! Every task delivery runs inside a span that names the job (and the shard,
//! for `ProcessShard`), so a single job can be followed through the logs of
//! many deliveries:
//!
//! ```text
//! shard{op=process_shard job_id=7 shard=2}: continuing shard in next task processed=66 next_task=1
//! ```

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::id::{JobId, ShardId};

static INIT: Once = Once::new();

/// Filter used when neither `RUST_LOG` nor `SHARDMAP_LOG` is set.
pub const DEFAULT_FILTER: &str = "info";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Multi-line human-readable output.
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses `json` or `pretty`, ignoring case and surrounding whitespace.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("SHARDMAP_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber. Later calls do nothing.
///
/// The filter comes from `RUST_LOG`, then `SHARDMAP_LOG`, then
/// [`DEFAULT_FILTER`].
///
/// ```rust
/// use shardmap_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Json);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let registry = tracing_subscriber::registry().with(env_filter());
        match format {
            LogFormat::Json => registry.with(fmt::layer().json()).init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
        }
    });
}

/// Span for a task that targets a whole job.
#[must_use]
pub fn job_span(operation: &str, job_id: JobId) -> Span {
    tracing::info_span!("job", op = operation, job_id = job_id.get())
}

/// Span for a task that targets one shard.
///
/// ```rust
/// use shardmap_core::id::{JobId, ShardId};
/// use shardmap_core::observability::shard_span;
///
/// let span = shard_span("process_shard", ShardId::new(JobId::new(7), 2));
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn shard_span(operation: &str, shard_id: ShardId) -> Span {
    tracing::info_span!(
        "shard",
        op = operation,
        job_id = shard_id.job_id.get(),
        shard = shard_id.index,
    )
}
