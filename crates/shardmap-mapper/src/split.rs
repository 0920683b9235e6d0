//! Key-range splitting.
//!
//! [`split`] partitions a key range into contiguous, ordered, non-overlapping
//! sub-ranges using scatter samples as candidate split points. Split points
//! are taken at evenly spaced quantiles of the samples, so shards hold roughly
//! equal numbers of entities when the samples are representative.
//!
//! When there are not enough distinct interior samples, fewer and wider
//! sub-ranges are produced. The union of the output is always exactly the
//! input range.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use shardmap_core::{Key, KeyRange};

use crate::error::Result;
use crate::job::EntityQuery;
use crate::source::EntitySource;

/// Default number of scatter samples requested per shard.
pub const DEFAULT_OVERSAMPLING: usize = 32;

/// One output range of the splitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitRange {
    /// The sub-range.
    pub range: KeyRange,
    /// Share of the estimated count attributed to this sub-range.
    pub expected_count: u64,
}

/// Splits `range` into at most `num_shards` sub-ranges.
///
/// `samples` are candidate split points; keys outside the interior of `range`
/// and duplicates are ignored. `estimated_count` is spread as evenly as
/// possible over the output, with the remainder going to earlier ranges.
/// A zero estimate or a single shard yields one range covering the input.
#[must_use]
pub fn split(
    range: &KeyRange,
    estimated_count: u64,
    num_shards: u32,
    samples: &[Key],
) -> Vec<SplitRange> {
    let points = if estimated_count == 0 || num_shards <= 1 {
        Vec::new()
    } else {
        split_points(range, num_shards as usize, samples)
    };

    let mut bounds: Vec<Option<Key>> = Vec::with_capacity(points.len() + 2);
    bounds.push(range.start.clone());
    bounds.extend(points.into_iter().map(Some));
    bounds.push(range.end.clone());

    let pieces = bounds.len() - 1;
    let counts = distribute(estimated_count, pieces);

    bounds
        .windows(2)
        .zip(counts)
        .map(|(pair, expected_count)| SplitRange {
            range: KeyRange::new(pair[0].clone(), pair[1].clone()),
            expected_count,
        })
        .collect()
}

fn split_points(range: &KeyRange, num_shards: usize, samples: &[Key]) -> Vec<Key> {
    let mut candidates: Vec<&Key> = samples.iter().filter(|k| range.is_interior(k)).collect();
    candidates.sort();
    candidates.dedup();

    let wanted = num_shards - 1;
    if candidates.len() <= wanted {
        return candidates.into_iter().cloned().collect();
    }

    let mut points: Vec<Key> = (1..num_shards)
        .map(|i| candidates[i * candidates.len() / num_shards].clone())
        .collect();
    points.dedup();
    points
}

fn distribute(total: u64, pieces: usize) -> Vec<u64> {
    let n = pieces as u64;
    let base = total / n;
    let remainder = total % n;
    (0..n).map(|i| base + u64::from(i < remainder)).collect()
}

/// Splits entity queries using samples from an [`EntitySource`].
#[derive(Clone)]
pub struct Splitter {
    source: Arc<dyn EntitySource>,
    oversampling: usize,
}

impl std::fmt::Debug for Splitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Splitter")
            .field("oversampling", &self.oversampling)
            .finish_non_exhaustive()
    }
}

impl Splitter {
    /// Creates a splitter with the default oversampling factor.
    #[must_use]
    pub fn new(source: Arc<dyn EntitySource>) -> Self {
        Self {
            source,
            oversampling: DEFAULT_OVERSAMPLING,
        }
    }

    /// Sets the number of samples requested per shard.
    #[must_use]
    pub fn with_oversampling(mut self, oversampling: usize) -> Self {
        self.oversampling = oversampling.max(1);
        self
    }

    /// Estimates the query size and splits it into at most `num_shards` ranges.
    ///
    /// # Errors
    ///
    /// Returns an error if counting or sampling fails.
    pub async fn split_query(&self, query: &EntityQuery, num_shards: u32) -> Result<Vec<SplitRange>> {
        let estimated = self.source.count(&query.kind, &query.range).await?;
        let samples = if estimated == 0 || num_shards <= 1 {
            Vec::new()
        } else {
            let max = (num_shards as usize).saturating_mul(self.oversampling);
            self.source
                .scatter_sample(&query.kind, &query.range, max)
                .await?
        };
        tracing::debug!(
            kind = %query.kind,
            estimated,
            samples = samples.len(),
            num_shards,
            "splitting query"
        );
        Ok(split(&query.range, estimated, num_shards, &samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::InMemoryEntities;

    fn keys(ids: &[i64]) -> Vec<Key> {
        ids.iter().map(|id| Key::int("K", *id)).collect()
    }

    #[test]
    fn single_shard_covers_input() {
        let range = KeyRange::new(Some(Key::int("K", 1)), Some(Key::int("K", 9)));
        let out = split(&range, 8, 1, &keys(&[3, 5]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].range, range);
        assert_eq!(out[0].expected_count, 8);
    }

    #[test]
    fn zero_estimate_yields_single_range() {
        let out = split(&KeyRange::unbounded(), 0, 4, &keys(&[1, 2, 3]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].range, KeyRange::unbounded());
        assert_eq!(out[0].expected_count, 0);
    }

    #[test]
    fn splits_at_sample_quantiles() {
        let samples = keys(&[10, 20, 30, 40, 50, 60, 70, 80]);
        let out = split(&KeyRange::unbounded(), 100, 4, &samples);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].range.start, None);
        assert_eq!(out[0].range.end, Some(Key::int("K", 30)));
        assert_eq!(out[1].range.end, Some(Key::int("K", 50)));
        assert_eq!(out[2].range.end, Some(Key::int("K", 70)));
        assert_eq!(out[3].range.end, None);
    }

    #[test]
    fn remainder_goes_to_earlier_ranges() {
        let out = split(&KeyRange::unbounded(), 10, 3, &keys(&[1, 2, 3, 4, 5, 6]));
        let counts: Vec<u64> = out.iter().map(|r| r.expected_count).collect();
        assert_eq!(counts, vec![4, 3, 3]);
    }

    #[test]
    fn too_few_samples_yield_fewer_shards() {
        let out = split(&KeyRange::unbounded(), 50, 8, &keys(&[7, 7, 9]));
        assert_eq!(out.len(), 3);
        let total: u64 = out.iter().map(|r| r.expected_count).sum();
        assert_eq!(total, 50);
    }

    #[test]
    fn samples_on_bounds_are_ignored() {
        let range = KeyRange::new(Some(Key::int("K", 5)), Some(Key::int("K", 10)));
        let out = split(&range, 5, 3, &keys(&[1, 5, 10, 12]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].range, range);
    }

    #[tokio::test]
    async fn splitter_uses_source_estimate() -> Result<()> {
        let source = Arc::new(InMemoryEntities::new());
        source.insert_ids("K", 1..=512)?;
        let splitter = Splitter::new(source);

        let out = splitter.split_query(&EntityQuery::kind("K"), 4).await?;
        assert_eq!(out.len(), 4);
        assert_eq!(out.iter().map(|r| r.expected_count).sum::<u64>(), 512);
        assert_eq!(out.first().and_then(|r| r.range.start.clone()), None);
        assert_eq!(out.last().and_then(|r| r.range.end.clone()), None);
        Ok(())
    }
}
