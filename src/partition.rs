use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Inclusive range of revision IDs. `start > end` is the empty range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdRange {
    pub start: u64,
    pub end: u64,
}

impl IdRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn empty() -> Self {
        Self { start: 1, end: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.start <= id && id <= self.end
    }

    pub fn intersect(&self, other: &IdRange) -> IdRange {
        IdRange::new(self.start.max(other.start), self.end.min(other.end))
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> {
        self.start..=self.end
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// One API request's worth of revision IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    pub ids: IdRange,
}

/// The share of chunks one download worker walks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerShare {
    pub worker: usize,
    pub chunks: Range<u64>,
    pub ids: IdRange,
}

/// Fixed-size chunking of the ID space `[1, total]`.
///
/// Chunk `i` covers `[i * per + 1, i * per + per]`, clipped to `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    per: u64,
    total: u64,
}

impl ChunkLayout {
    pub fn new(per: u64, total: u64) -> Result<Self> {
        if per == 0 {
            bail!("Chunk size must be greater than zero");
        }
        Ok(Self { per, total })
    }

    pub fn per(&self) -> u64 {
        self.per
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn full_range(&self) -> IdRange {
        IdRange::new(1, self.total)
    }

    pub fn chunk_count(&self) -> u64 {
        self.total.div_ceil(self.per)
    }

    /// Index of the chunk holding `id` (IDs start at 1).
    pub fn chunk_of(&self, id: u64) -> u64 {
        id.saturating_sub(1) / self.per
    }

    pub fn chunk(&self, index: u64) -> Option<Chunk> {
        if index >= self.chunk_count() {
            return None;
        }
        let start = index * self.per + 1;
        let end = (start + self.per - 1).min(self.total);
        Some(Chunk {
            index,
            ids: IdRange::new(start, end),
        })
    }

    pub fn chunks(&self, indices: Range<u64>) -> impl Iterator<Item = Chunk> + '_ {
        indices.filter_map(move |i| self.chunk(i))
    }

    /// Chunks overlapping `window`, after clipping the window to `[1, total]`.
    pub fn chunks_overlapping(&self, window: IdRange) -> impl Iterator<Item = Chunk> + '_ {
        let clipped = window.intersect(&self.full_range());
        let indices = if clipped.is_empty() {
            0..0
        } else {
            self.chunk_of(clipped.start)..self.chunk_of(clipped.end) + 1
        };
        self.chunks(indices)
    }

    /// Splits the chunks into `workers` contiguous shares.
    ///
    /// Every share gets `chunk_count / workers` chunks; the last share also
    /// takes the remainder. Shares never split a chunk, so no two workers
    /// ever write the same chunk index.
    pub fn worker_shares(&self, workers: usize) -> Result<Vec<WorkerShare>> {
        if workers == 0 {
            bail!("Worker count must be greater than zero");
        }
        let count = self.chunk_count();
        let per_worker = count / workers as u64;

        let shares = (0..workers)
            .map(|worker| {
                let first = worker as u64 * per_worker;
                let last = if worker + 1 == workers {
                    count
                } else {
                    first + per_worker
                };
                let ids = if first == last {
                    IdRange::empty()
                } else {
                    IdRange::new(first * self.per + 1, (last * self.per).min(self.total))
                };
                WorkerShare {
                    worker,
                    chunks: first..last,
                    ids,
                }
            })
            .collect();
        Ok(shares)
    }

    /// Fixed windows `[1, size], [size + 1, 2 * size], ...`; the last one may be short.
    pub fn slices(&self, size: u64) -> Result<Vec<IdRange>> {
        if size == 0 {
            bail!("Slice size must be greater than zero");
        }
        let count = self.total.div_ceil(size);
        Ok((0..count)
            .map(|i| IdRange::new(i * size + 1, ((i + 1) * size).min(self.total)))
            .collect())
    }
}
