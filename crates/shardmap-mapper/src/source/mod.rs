//! Read access to the entities a job maps over.
//!
//! The [`EntitySource`] trait is the only view the controller has of the
//! backing entity store. It needs:
//!
//! - **Paged keys-only queries** with resumable cursors
//! - **Count estimates** over a key range
//! - **Scatter sampling** to pick split points
//!
//! Implementations should return [`Error::Transient`](crate::error::Error::Transient)
//! for retryable backend failures.

pub mod memory;

use async_trait::async_trait;

use shardmap_core::{Cursor, Key, KeyRange};

use crate::error::Result;

/// A keys-only query for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysQuery {
    /// Entity kind.
    pub kind: String,
    /// Range restriction.
    pub range: KeyRange,
    /// Continue strictly after this position.
    pub start: Option<Cursor>,
    /// Maximum number of keys to return.
    pub limit: usize,
}

/// One page of keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPage {
    /// Keys in ascending order.
    pub keys: Vec<Key>,
    /// Position after the last key, if any key was returned.
    pub cursor: Option<Cursor>,
}

impl KeyPage {
    /// Returns true if the page holds fewer keys than were requested.
    #[must_use]
    pub fn is_short(&self, limit: usize) -> bool {
        self.keys.len() < limit
    }
}

/// Read-only view of the entity store.
#[async_trait]
pub trait EntitySource: Send + Sync {
    /// Fetches up to `query.limit` keys in ascending order.
    async fn query_keys(&self, query: &KeysQuery) -> Result<KeyPage>;

    /// Counts or estimates the entities of `kind` within `range`.
    async fn count(&self, kind: &str, range: &KeyRange) -> Result<u64>;

    /// Returns up to `max` keys within `range`, sorted ascending, chosen so
    /// that they are spread across the key space.
    async fn scatter_sample(&self, kind: &str, range: &KeyRange, max: usize) -> Result<Vec<Key>>;
}
