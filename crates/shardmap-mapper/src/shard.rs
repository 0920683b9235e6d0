//! Shard records and the per-shard state machine.
//!
//! A shard is one contiguous slice of a job's key range. Its record carries
//! everything needed to resume processing after a crash: the resume cursor,
//! the processed count, and the task number that guards against duplicate
//! deliveries.
//!
//! ```text
//! ┌──────────┐ first page ┌─────────┐
//! │ STARTING │───────────►│ RUNNING │──┐
//! └──────────┘            └─────────┘  │
//!      │                               ▼
//!      └──────────────────────► SUCCESS | FAIL | ABORTED
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shardmap_core::{Cursor, KeyRange, ShardId};

use crate::error::{Error, Result};

/// Shard state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardState {
    /// Record exists; no page has been processed yet.
    Starting,
    /// At least one page has been processed.
    Running,
    /// Range exhausted without error.
    Success,
    /// The mapper returned a non-transient error.
    Fail,
    /// A job-level abort was observed.
    Aborted,
}

impl ShardState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fail | Self::Aborted)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Starting => !matches!(target, Self::Starting),
            Self::Running => target.is_terminal(),
            Self::Success | Self::Fail | Self::Aborted => false,
        }
    }

    /// Lowercase label used in metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Fail => write!(f, "FAIL"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Persisted record of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shard {
    /// Owning job and index.
    pub id: ShardId,
    /// Key range assigned at creation. Never mutated.
    pub range: KeyRange,
    /// Current state.
    pub state: ShardState,
    /// Estimated number of entities in the range.
    pub expected_count: u64,
    /// Entities successfully handed to the mapper so far.
    pub processed_count: u64,
    /// Number of the `ProcessShard` task the shard currently accepts.
    pub process_task_num: u32,
    /// Position after the last checkpointed page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<Cursor>,
    /// Failure text, set on FAIL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Transient mapper failures seen so far.
    #[serde(default)]
    pub transient_retries: u32,
    /// When the shard was created.
    pub created_at: DateTime<Utc>,
    /// Last state-affecting write.
    pub updated_at: DateTime<Utc>,
    /// Store-managed version for compare-and-swap writes.
    #[serde(default)]
    pub version: u64,
}

impl Shard {
    /// Creates a shard in `STARTING`.
    #[must_use]
    pub fn new(id: ShardId, range: KeyRange, expected_count: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            range,
            state: ShardState::Starting,
            expected_count,
            processed_count: 0,
            process_task_num: 0,
            resume_from: None,
            error: None,
            transient_retries: 0,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Returns the shard index within its job.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.id.index
    }

    /// Returns true if the shard will not change again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Transitions to `target`, refreshing `updated_at`.
    ///
    /// Transitioning to the current non-terminal state is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the state machine forbids
    /// the move.
    pub fn transition_to(&mut self, target: ShardState) -> Result<()> {
        if self.state == target && !target.is_terminal() {
            return Ok(());
        }
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: format!("shard {} forbids this transition", self.id),
            });
        }
        self.state = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Records a successfully mapped page and moves the resume point.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard is terminal.
    pub fn record_page(&mut self, mapped: usize, next: Option<Cursor>) -> Result<()> {
        self.transition_to(ShardState::Running)?;
        self.processed_count += mapped as u64;
        if next.is_some() {
            self.resume_from = next;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Marks the shard failed with a diagnostic message.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard is already terminal.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition_to(ShardState::Fail)?;
        self.error = Some(message.into());
        Ok(())
    }

    /// Fraction of expected entities processed, in percent.
    ///
    /// Returns `None` when no estimate was recorded.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress_percent(&self) -> Option<f64> {
        if self.expected_count == 0 {
            return None;
        }
        Some((self.processed_count as f64 / self.expected_count as f64 * 100.0).min(100.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardmap_core::{JobId, Key};

    fn shard() -> Shard {
        Shard::new(ShardId::new(JobId::new(1), 0), KeyRange::unbounded(), 100)
    }

    #[test]
    fn terminal_states() {
        assert!(ShardState::Success.is_terminal());
        assert!(ShardState::Fail.is_terminal());
        assert!(ShardState::Aborted.is_terminal());
        assert!(!ShardState::Starting.is_terminal());
        assert!(!ShardState::Running.is_terminal());
    }

    #[test]
    fn starting_may_skip_running() {
        assert!(ShardState::Starting.can_transition_to(ShardState::Aborted));
        assert!(ShardState::Starting.can_transition_to(ShardState::Success));
        assert!(!ShardState::Running.can_transition_to(ShardState::Starting));
    }

    #[test]
    fn terminal_state_is_sticky() {
        let mut shard = shard();
        shard.transition_to(ShardState::Success).unwrap();
        for target in [
            ShardState::Starting,
            ShardState::Running,
            ShardState::Success,
            ShardState::Fail,
            ShardState::Aborted,
        ] {
            assert!(shard.transition_to(target).is_err());
            assert_eq!(shard.state, ShardState::Success);
        }
    }

    #[test]
    fn record_page_advances_progress() {
        let mut shard = shard();
        let cursor = Cursor::after(&Key::int("K", 33)).unwrap();
        shard.record_page(33, Some(cursor.clone())).unwrap();
        assert_eq!(shard.state, ShardState::Running);
        assert_eq!(shard.processed_count, 33);
        assert_eq!(shard.resume_from, Some(cursor));
        let percent = shard.progress_percent().unwrap();
        assert!((percent - 33.0).abs() < 1e-9);
    }

    #[test]
    fn empty_page_keeps_resume_point() {
        let mut shard = shard();
        let cursor = Cursor::after(&Key::int("K", 1)).unwrap();
        shard.record_page(1, Some(cursor.clone())).unwrap();
        shard.record_page(0, None).unwrap();
        assert_eq!(shard.resume_from, Some(cursor));
        assert_eq!(shard.processed_count, 1);
    }

    #[test]
    fn fail_records_error() {
        let mut shard = shard();
        shard.fail("while mapping 3 keys: boom").unwrap();
        assert_eq!(shard.state, ShardState::Fail);
        assert_eq!(shard.error.as_deref(), Some("while mapping 3 keys: boom"));
        assert!(shard.fail("again").is_err());
    }

    #[test]
    fn shard_serializes_with_screaming_state() {
        let json = serde_json::to_value(shard()).unwrap();
        assert_eq!(json["state"], "STARTING");
        let parsed: Shard = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.expected_count, 100);
    }
}
