//! Ordered entity keys, key ranges, and resumable cursors.
//!
//! Keys order first by entity kind, then by ID. Integer IDs sort before
//! string names, matching the ordering of the backing entity store.
//!
//! A [`KeyRange`] is half-open: `start` is inclusive and `end` is exclusive.
//! Either bound may be absent, meaning "lowest" or "highest" respectively.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The ID part of a key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyId {
    /// Numeric ID.
    Int(i64),
    /// String name.
    Name(String),
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(id) => write!(f, "{id}"),
            Self::Name(name) => write!(f, "{name:?}"),
        }
    }
}

/// Key of one entity in the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Key {
    /// Entity kind.
    pub kind: String,
    /// ID within the kind.
    pub id: KeyId,
}

impl Key {
    /// Creates a key with a numeric ID.
    #[must_use]
    pub fn int(kind: impl Into<String>, id: i64) -> Self {
        Self {
            kind: kind.into(),
            id: KeyId::Int(id),
        }
    }

    /// Creates a key with a string name.
    #[must_use]
    pub fn name(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: KeyId::Name(name.into()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.id)
    }
}

/// Half-open range of keys, `[start, end)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRange {
    /// Inclusive lower bound; `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Key>,
    /// Exclusive upper bound; `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Key>,
}

impl KeyRange {
    /// Creates a range from optional bounds.
    #[must_use]
    pub const fn new(start: Option<Key>, end: Option<Key>) -> Self {
        Self { start, end }
    }

    /// The range covering every key.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    /// Returns true if the key lies within the range.
    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        self.start.as_ref().is_none_or(|start| key >= start)
            && self.end.as_ref().is_none_or(|end| key < end)
    }

    /// Returns true if `key` lies strictly inside the range, so splitting at it
    /// yields two non-empty halves.
    #[must_use]
    pub fn is_interior(&self, key: &Key) -> bool {
        self.start.as_ref().is_none_or(|start| key > start)
            && self.end.as_ref().is_none_or(|end| key < end)
    }

    /// Returns true if no key can satisfy the bounds.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!((&self.start, &self.end), (Some(start), Some(end)) if start >= end)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start {
            Some(start) => write!(f, "[{start}, ")?,
            None => write!(f, "[-inf, ")?,
        }
        match &self.end {
            Some(end) => write!(f, "{end})"),
            None => write!(f, "+inf)"),
        }
    }
}

/// Opaque marker for resuming a paged query.
///
/// Encodes the last key returned so the next page starts strictly after it.
/// Callers should treat the contents as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Creates a cursor positioned after `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be serialized.
    pub fn after(key: &Key) -> Result<Self> {
        let json = serde_json::to_vec(key)?;
        Ok(Self(URL_SAFE_NO_PAD.encode(json)))
    }

    /// Decodes the key the cursor is positioned after.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCursor`] if the cursor was not produced by
    /// [`Cursor::after`].
    pub fn last_key(&self) -> Result<Key> {
        let bytes = URL_SAFE_NO_PAD
            .decode(self.0.as_bytes())
            .map_err(|e| Error::InvalidCursor {
                message: e.to_string(),
            })?;
        serde_json::from_slice(&bytes).map_err(|e| Error::InvalidCursor {
            message: e.to_string(),
        })
    }

    /// Returns the encoded form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_ids_sort_before_names() {
        assert!(Key::int("User", i64::MAX) < Key::name("User", ""));
    }

    #[test]
    fn keys_sort_by_kind_first() {
        assert!(Key::int("A", 100) < Key::int("B", 1));
    }

    #[test]
    fn range_is_half_open() {
        let range = KeyRange::new(Some(Key::int("K", 10)), Some(Key::int("K", 20)));
        assert!(!range.contains(&Key::int("K", 9)));
        assert!(range.contains(&Key::int("K", 10)));
        assert!(range.contains(&Key::int("K", 19)));
        assert!(!range.contains(&Key::int("K", 20)));
    }

    #[test]
    fn interior_excludes_start() {
        let range = KeyRange::new(Some(Key::int("K", 10)), None);
        assert!(!range.is_interior(&Key::int("K", 10)));
        assert!(range.is_interior(&Key::int("K", 11)));
    }

    #[test]
    fn unbounded_range_contains_everything() {
        assert!(KeyRange::unbounded().contains(&Key::name("Z", "zzz")));
        assert!(!KeyRange::unbounded().is_empty());
    }

    #[test]
    fn inverted_range_is_empty() {
        let range = KeyRange::new(Some(Key::int("K", 5)), Some(Key::int("K", 5)));
        assert!(range.is_empty());
    }

    #[test]
    fn cursor_decodes_last_key() {
        let key = Key::name("Doc", "abc");
        let cursor = Cursor::after(&key).unwrap();
        assert_eq!(cursor.last_key().unwrap(), key);
    }

    #[test]
    fn garbage_cursor_is_rejected() {
        let cursor: Cursor = serde_json::from_str("\"!!not-base64!!\"").unwrap();
        assert!(matches!(cursor.last_key(), Err(Error::InvalidCursor { .. })));
    }

    #[test]
    fn range_display() {
        let range = KeyRange::new(Some(Key::int("K", 1)), None);
        assert_eq!(range.to_string(), "[K(1), +inf)");
    }
}
