use crate::error::ChunkFailure;
use crate::fetch::Fetcher;
use crate::models::{Author, ChunkResult, EditCount, EditTable};
use crate::partition::{ChunkLayout, IdRange};
use crate::stats::PipelineStats;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-window accumulator. Hashes while counting, orders once at the end.
#[derive(Default)]
pub struct Tally {
    users: FxHashMap<String, EditCount>,
}

impl Tally {
    pub fn record(&mut self, author: &Author, namespace: i32) {
        let key = author.key();
        match self.users.get_mut(key) {
            Some(count) => count.record(namespace),
            None => {
                let mut count = EditCount::default();
                count.record(namespace);
                self.users.insert(key.to_string(), count);
            }
        }
    }

    pub fn finish(self) -> EditTable {
        self.users.into_iter().collect()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTally {
    pub counted: u64,
    pub malformed: u64,
    pub out_of_range: u64,
}

/// Counts the records of one chunk that fall inside `window`.
///
/// Chunk boundaries are independent of the window, so records outside it are
/// expected and dropped silently. Malformed records are skipped one by one.
pub fn tally_chunk(result: &ChunkResult, window: IdRange, tally: &mut Tally) -> ChunkTally {
    let mut summary = ChunkTally::default();
    for record in result.records() {
        match record {
            Ok(rev) if window.contains(rev.revid) => {
                if matches!(rev.author, Author::Hidden) {
                    debug!(revid = rev.revid, "Author is hidden");
                }
                tally.record(&rev.author, rev.namespace);
                summary.counted += 1;
            }
            Ok(_) => summary.out_of_range += 1,
            Err(e) => {
                warn!(error = %e, "Skipping malformed revision record");
                summary.malformed += 1;
            }
        }
    }
    summary
}

/// Builds edit tables for arbitrary ID windows from cached chunks, fetching
/// missing chunks on demand.
#[derive(Clone)]
pub struct Extractor {
    layout: ChunkLayout,
    fetcher: Fetcher,
    stats: Arc<PipelineStats>,
}

impl Extractor {
    pub fn new(layout: ChunkLayout, fetcher: Fetcher, stats: Arc<PipelineStats>) -> Self {
        Self {
            layout,
            fetcher,
            stats,
        }
    }

    pub async fn extract(&self, window: IdRange) -> Result<EditTable, ChunkFailure> {
        if window.is_empty() {
            return Ok(EditTable::new());
        }

        let mut tally = Tally::default();
        let mut total = ChunkTally::default();
        for chunk in self.layout.chunks_overlapping(window) {
            let result = self.fetcher.ensure(&chunk).await?;
            let summary = tally_chunk(&result, window, &mut tally);
            total.counted += summary.counted;
            total.malformed += summary.malformed;
            total.out_of_range += summary.out_of_range;
        }

        self.stats.add_counted(total.counted);
        self.stats.add_malformed(total.malformed);
        self.stats.add_out_of_range(total.out_of_range);
        debug!(
            window = %window,
            counted = total.counted,
            malformed = total.malformed,
            out_of_range = total.out_of_range,
            "Window extracted"
        );
        Ok(tally.finish())
    }
}
