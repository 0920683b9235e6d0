//! Environment-variable configuration helpers.
//!
//! Services build their configuration from defaults and then override fields
//! from `SHARDMAP_*` variables. Values are trimmed; empty values count as unset.
//! Present-but-unparseable values are errors rather than silently ignored.
//!
//! [`EnvReader`] abstracts over the variable source so loaders can be tested
//! without touching the process environment.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};

/// Source of configuration variables.
#[derive(Debug, Clone)]
pub enum EnvReader {
    /// Reads from the process environment.
    Process,
    /// Reads from a fixed map (tests, embedded configuration).
    Fixed(HashMap<String, String>),
}

impl EnvReader {
    /// Reader over the process environment.
    #[must_use]
    pub const fn process() -> Self {
        Self::Process
    }

    /// Reader over a fixed set of pairs.
    #[must_use]
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self::Fixed(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn raw(&self, name: &str) -> Option<String> {
        match self {
            Self::Process => std::env::var(name).ok(),
            Self::Fixed(map) => map.get(name).cloned(),
        }
    }

    /// Returns the trimmed value, or `None` when unset or blank.
    #[must_use]
    pub fn string(&self, name: &str) -> Option<String> {
        self.raw(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    /// Parses an unsigned 64-bit value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the variable is set but not a `u64`.
    pub fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
    }

    /// Parses an unsigned 32-bit value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the variable is set but not a `u32`.
    pub fn u32(&self, name: &str) -> Result<Option<u32>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u32>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u32: {e}")))
    }

    /// Parses a boolean (`true/false/1/0/yes/no/y/n`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the variable is set but not a boolean.
    pub fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }

    /// Parses a duration given in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the variable is set but not a `u64`.
    pub fn duration_ms(&self, name: &str) -> Result<Option<Duration>> {
        Ok(self.u64(name)?.map(Duration::from_millis))
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}
