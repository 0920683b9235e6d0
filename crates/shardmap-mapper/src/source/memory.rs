//! In-memory entity source for testing.
//!
//! Keys are kept per kind in ordered sets. Scatter sampling orders keys by a
//! fixed hash of the key, so samples are spread across the key space and are
//! reproducible within a process.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: keys only, no entity bodies
//! - **Exact counts**: `count` walks the range instead of estimating

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::ops::Bound;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use shardmap_core::{Cursor, Key, KeyRange};

use super::{EntitySource, KeyPage, KeysQuery};
use crate::error::{Error, Result};

/// In-memory entity keys grouped by kind.
#[derive(Debug, Default)]
pub struct InMemoryEntities {
    kinds: RwLock<BTreeMap<String, BTreeSet<Key>>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("entity source lock poisoned")
}

fn scatter_hash(key: &Key) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

impl InMemoryEntities {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a key.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn insert(&self, key: Key) -> Result<()> {
        let mut kinds = self.kinds.write().map_err(poison_err)?;
        kinds.entry(key.kind.clone()).or_default().insert(key);
        drop(kinds);
        Ok(())
    }

    /// Inserts integer-keyed entities `ids` of `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn insert_ids(&self, kind: &str, ids: impl IntoIterator<Item = i64>) -> Result<()> {
        let mut kinds = self.kinds.write().map_err(poison_err)?;
        let set = kinds.entry(kind.to_string()).or_default();
        for id in ids {
            set.insert(Key::int(kind, id));
        }
        drop(kinds);
        Ok(())
    }

    /// Returns the number of keys stored for `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self, kind: &str) -> Result<usize> {
        let kinds = self.kinds.read().map_err(poison_err)?;
        Ok(kinds.get(kind).map_or(0, BTreeSet::len))
    }

    fn keys_in(&self, kind: &str, range: &KeyRange, after: Option<&Key>) -> Result<Vec<Key>> {
        let kinds = self.kinds.read().map_err(poison_err)?;
        let Some(set) = kinds.get(kind) else {
            return Ok(Vec::new());
        };

        let lower = match (after, range.start.as_ref()) {
            (Some(after), Some(start)) if start > after => Bound::Included(start),
            (Some(after), _) => Bound::Excluded(after),
            (None, Some(start)) => Bound::Included(start),
            (None, None) => Bound::Unbounded,
        };
        let keys = set
            .range::<Key, _>((lower, Bound::Unbounded))
            .take_while(|k| range.end.as_ref().is_none_or(|end| *k < end))
            .cloned()
            .collect();
        Ok(keys)
    }
}

#[async_trait]
impl EntitySource for InMemoryEntities {
    async fn query_keys(&self, query: &KeysQuery) -> Result<KeyPage> {
        let after = query.start.as_ref().map(Cursor::last_key).transpose()?;
        let mut keys = self.keys_in(&query.kind, &query.range, after.as_ref())?;
        keys.truncate(query.limit);
        let cursor = keys.last().map(Cursor::after).transpose()?;
        Ok(KeyPage { keys, cursor })
    }

    async fn count(&self, kind: &str, range: &KeyRange) -> Result<u64> {
        Ok(self.keys_in(kind, range, None)?.len() as u64)
    }

    async fn scatter_sample(&self, kind: &str, range: &KeyRange, max: usize) -> Result<Vec<Key>> {
        let mut keys = self.keys_in(kind, range, None)?;
        keys.sort_by_cached_key(scatter_hash);
        keys.truncate(max);
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> InMemoryEntities {
        let source = InMemoryEntities::new();
        source.insert_ids("Item", 1..=10).unwrap();
        source.insert_ids("Other", 1..=3).unwrap();
        source
    }

    fn query(limit: usize, start: Option<Cursor>) -> KeysQuery {
        KeysQuery {
            kind: "Item".into(),
            range: KeyRange::unbounded(),
            start,
            limit,
        }
    }

    #[tokio::test]
    async fn pages_resume_from_cursor() -> Result<()> {
        let source = source();

        let first = source.query_keys(&query(4, None)).await?;
        assert_eq!(first.keys.first(), Some(&Key::int("Item", 1)));
        assert_eq!(first.keys.len(), 4);

        let second = source.query_keys(&query(4, first.cursor)).await?;
        assert_eq!(second.keys.first(), Some(&Key::int("Item", 5)));

        let third = source.query_keys(&query(4, second.cursor)).await?;
        assert_eq!(third.keys.len(), 2);
        assert!(third.is_short(4));
        Ok(())
    }

    #[tokio::test]
    async fn range_bounds_are_respected() -> Result<()> {
        let source = source();
        let range = KeyRange::new(Some(Key::int("Item", 3)), Some(Key::int("Item", 6)));
        let page = source
            .query_keys(&KeysQuery {
                kind: "Item".into(),
                range: range.clone(),
                start: None,
                limit: 100,
            })
            .await?;
        let ids: Vec<_> = page.keys.iter().map(ToString::to_string).collect();
        assert_eq!(ids, vec!["Item(3)", "Item(4)", "Item(5)"]);
        assert_eq!(source.count("Item", &range).await?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn empty_page_has_no_cursor() -> Result<()> {
        let source = source();
        let page = source
            .query_keys(&KeysQuery {
                kind: "Missing".into(),
                range: KeyRange::unbounded(),
                start: None,
                limit: 5,
            })
            .await?;
        assert!(page.keys.is_empty());
        assert!(page.cursor.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn scatter_sample_is_sorted_and_bounded() -> Result<()> {
        let source = InMemoryEntities::new();
        source.insert_ids("Item", 1..=500)?;
        let sample = source.scatter_sample("Item", &KeyRange::unbounded(), 20).await?;
        assert_eq!(sample.len(), 20);
        assert!(sample.windows(2).all(|w| w[0] < w[1]));

        let again = source.scatter_sample("Item", &KeyRange::unbounded(), 20).await?;
        assert_eq!(sample, again);
        Ok(())
    }
}
