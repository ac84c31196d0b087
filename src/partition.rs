//! Row numbering and shard layout
//!
//! Every distinct loan id gets a dense index `0..total`. Shards are contiguous
//! ranges of that index, so a loan belongs to exactly one shard.

use std::ops::Range;
use std::sync::Arc;

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::error::{CollapseError, Result};

/// Dense numbering of distinct entity ids in sorted order
#[derive(Debug, Clone, Default)]
pub struct RowIndex {
    ids: Vec<String>,
    positions: FxHashMap<String, usize>,
}

impl RowIndex {
    /// Sort and deduplicate `ids`, then number them
    #[must_use]
    pub fn build(mut ids: Vec<String>) -> Self {
        ids.par_sort_unstable();
        ids.dedup();
        let positions = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        Self { ids, positions }
    }

    /// Number of distinct ids
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when no id was numbered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Dense index of an id
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }
}

/// A contiguous range of the dense row index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    /// Shard number, `0..n`
    pub id: usize,
    /// Rows owned by this shard
    pub rows: Range<usize>,
}

impl Shard {
    /// Number of entities in the shard
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True for a shard with no entities
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Split `total` rows into `n` contiguous shards
///
/// Shard sizes differ by at most one; the first `total % n` shards take the
/// larger size. When `total < n` the trailing shards are empty.
pub fn partition(total: usize, n: usize) -> Result<Vec<Shard>> {
    if n == 0 {
        return Err(CollapseError::partition("shard count must be at least 1"));
    }
    let base = total / n;
    let extra = total % n;
    let mut start = 0;
    let shards = (0..n)
        .map(|id| {
            let size = base + usize::from(id < extra);
            let shard = Shard {
                id,
                rows: start..start + size,
            };
            start += size;
            shard
        })
        .collect();
    Ok(shards)
}

/// Membership test handed to a source scan
#[derive(Debug, Clone)]
pub struct ShardFilter {
    index: Arc<RowIndex>,
    shard: Shard,
}

impl ShardFilter {
    /// Filter selecting the entities of `shard`
    #[must_use]
    pub const fn new(index: Arc<RowIndex>, shard: Shard) -> Self {
        Self { index, shard }
    }

    /// The shard this filter selects
    #[must_use]
    pub const fn shard(&self) -> &Shard {
        &self.shard
    }

    /// Whether `id` belongs to the shard
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index
            .position(id)
            .is_some_and(|pos| self.shard.rows.contains(&pos))
    }
}
