//! Strongly-typed identifiers for shardmap entities.
//!
//! - [`JobId`]: monotonically increasing integer assigned by the record store
//! - [`ShardId`]: the owning job plus a 0-based shard index
//! - [`MapperId`]: the name a mapper factory is registered under
//!
//! # Example
//!
//! ```rust
//! use shardmap_core::id::{JobId, ShardId};
//!
//! let job = JobId::new(7);
//! let shard = ShardId::new(job, 2);
//! assert_eq!(shard.to_string(), "7-2");
//! assert_eq!("7-2".parse::<ShardId>().unwrap(), shard);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Identifier of a mapping job.
///
/// Job IDs are allocated by the record store from a counter, so later jobs
/// always compare greater than earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    /// Creates a job ID from its raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>().map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid job ID '{s}': {e}"),
        })
    }
}

/// Identifier of one shard of a job.
///
/// Shards are children of their job; the index is 0-based and dense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardId {
    /// Owning job.
    pub job_id: JobId,
    /// Position of the shard within the job.
    pub index: u32,
}

impl ShardId {
    /// Creates a shard ID.
    #[must_use]
    pub const fn new(job_id: JobId, index: u32) -> Self {
        Self { job_id, index }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.job_id, self.index)
    }
}

impl FromStr for ShardId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |detail: &str| Error::InvalidId {
            message: format!("invalid shard ID '{s}': {detail}"),
        };
        let (job, index) = s.split_once('-').ok_or_else(|| invalid("expected '<job>-<index>'"))?;
        let job_id = job.parse::<JobId>()?;
        let index = index.parse::<u32>().map_err(|e| invalid(&e.to_string()))?;
        Ok(Self::new(job_id, index))
    }
}

/// Name under which a mapper factory is registered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapperId(String);

impl MapperId {
    /// Creates a mapper ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MapperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MapperId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}
