use crate::cache::ChunkStore;
use crate::checkpoint::SliceStore;
use crate::client::RevisionSource;
use crate::error::ChunkFailure;
use crate::extract::Extractor;
use crate::fetch::{Fetcher, RetryPolicy};
use crate::merge::reduce_tables;
use crate::models::EditTable;
use crate::partition::{ChunkLayout, IdRange, WorkerShare};
use crate::stats::PipelineStats;
use anyhow::{bail, Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a run needs, built once at startup.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub data_dir: PathBuf,
    pub layout: ChunkLayout,
    pub workers: usize,
    pub slice_size: u64,
    pub slice_parallelism: usize,
    pub retry: RetryPolicy,
    pub show_progress: bool,
}

/// Download and aggregation driver.
///
/// Download: one task per worker share walks its chunks in order, skipping
/// cached ones; all tasks join before aggregation starts. Aggregation:
/// report slices are extracted with bounded concurrency (fetching any chunk
/// still missing), persisted, and tree-reduced into one table.
pub struct Pipeline {
    config: RunConfig,
    fetcher: Fetcher,
    extractor: Extractor,
    slices: SliceStore,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        config: RunConfig,
        source: Arc<dyn RevisionSource>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let stats = Arc::new(PipelineStats::new());
        let store = Arc::new(ChunkStore::open(&config.data_dir)?);
        let slices = SliceStore::open(&config.data_dir)?;
        let fetcher = Fetcher::new(source, store, config.retry, cancel.clone(), stats.clone());
        let extractor = Extractor::new(config.layout, fetcher.clone(), stats.clone());

        Ok(Self {
            config,
            fetcher,
            extractor,
            slices,
            stats,
            cancel,
        })
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn slice_store(&self) -> &SliceStore {
        &self.slices
    }

    pub async fn run(&self) -> Result<EditTable> {
        self.download().await?;
        self.aggregate().await
    }

    /// Fetches every chunk of `[1, total]` that is not cached yet.
    pub async fn download(&self) -> Result<()> {
        let layout = self.config.layout;
        let shares = layout.worker_shares(self.config.workers)?;
        let pb = self.progress_bar(layout.chunk_count(), "Chunks");
        let start = Instant::now();

        info!(
            total = layout.total(),
            chunks = layout.chunk_count(),
            workers = self.config.workers,
            "Starting download"
        );

        let mut in_flight = FuturesUnordered::new();
        for share in shares.into_iter().filter(|s| !s.chunks.is_empty()) {
            let fetcher = self.fetcher.clone();
            let pb = pb.clone();
            in_flight.push(tokio::spawn(download_share(fetcher, layout, share, pb)));
        }

        let mut failure: Option<ChunkFailure> = None;
        while let Some(joined) = in_flight.next().await {
            match joined.context("Download worker panicked")? {
                Ok(()) => {}
                Err(e) => {
                    if !e.is_cancelled() {
                        warn!(chunk = e.chunk(), error = %e, "Download worker failed, stopping others");
                    }
                    self.cancel.cancel();
                    let replace = match &failure {
                        None => true,
                        Some(existing) => existing.is_cancelled() && !e.is_cancelled(),
                    };
                    if replace {
                        failure = Some(e);
                    }
                }
            }
        }

        pb.finish_and_clear();
        if let Some(e) = failure {
            return Err(e).context("Download aborted");
        }

        info!(
            duration_secs = start.elapsed().as_secs_f64(),
            fetched = self.stats.fetched(),
            cached = self.stats.cached(),
            retries = self.stats.retries(),
            "Download complete"
        );
        Ok(())
    }

    /// Builds the edit table for `[1, total]` slice by slice.
    pub async fn aggregate(&self) -> Result<EditTable> {
        let slices = self.config.layout.slices(self.config.slice_size)?;
        let pb = self.progress_bar(slices.len() as u64, "Slices");
        let parallelism = self.config.slice_parallelism.max(1);
        let start = Instant::now();

        let mut tables = Vec::with_capacity(slices.len());
        let mut pending = slices.into_iter().enumerate();
        let mut in_flight = FuturesUnordered::new();

        for (index, range) in pending.by_ref().take(parallelism) {
            in_flight.push(self.process_slice(index, range));
        }
        while let Some(result) = in_flight.next().await {
            tables.push(result?);
            pb.inc(1);
            if let Some((index, range)) = pending.next() {
                in_flight.push(self.process_slice(index, range));
            }
        }
        pb.finish_and_clear();

        let slice_count = tables.len();
        let table = tokio::task::spawn_blocking(move || reduce_tables(tables))
            .await
            .context("Merge task panicked")?;

        if !table.is_consistent() {
            bail!("Merged table has totals that do not match namespace counts");
        }

        info!(
            duration_secs = start.elapsed().as_secs_f64(),
            slices = slice_count,
            users = table.len(),
            edits = table.total_edits(),
            "Aggregation complete"
        );
        Ok(table)
    }

    async fn process_slice(&self, index: usize, range: IdRange) -> Result<EditTable> {
        if self.cancel.is_cancelled() {
            bail!("Aggregation cancelled before slice {} {}", index, range);
        }

        if let Some(table) = self.slices.load_if_valid(index, range) {
            self.stats.inc_slices_cached();
            debug!(slice = index, range = %range, "Slice loaded from checkpoint");
            return Ok(table);
        }

        let table = self
            .extractor
            .extract(range)
            .await
            .with_context(|| format!("Failed to extract slice {} {}", index, range))?;
        self.slices.save(index, range, &table)?;
        self.stats.inc_slices_computed();
        Ok(table)
    }

    fn progress_bar(&self, total: u64, label: &str) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        make_progress_bar(total, label)
    }
}

async fn download_share(
    fetcher: Fetcher,
    layout: ChunkLayout,
    share: WorkerShare,
    pb: ProgressBar,
) -> Result<(), ChunkFailure> {
    debug!(worker = share.worker, ids = %share.ids, "Worker started");
    for chunk in layout.chunks(share.chunks.clone()) {
        fetcher.ensure(&chunk).await?;
        pb.inc(1);
    }
    debug!(worker = share.worker, ids = %share.ids, "Worker finished");
    Ok(())
}

fn make_progress_bar(total: u64, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template(&format!(
            "    {{spinner:.cyan}} {label:<8} [{{bar:30.cyan/blue}}] {{pos}}/{{len}} ({{eta}})"
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    pb.set_style(style);
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::models::ChunkResult;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Answers every request as if all revisions were deleted.
    struct EmptySource;

    #[async_trait]
    impl RevisionSource for EmptySource {
        async fn fetch_revisions(&self, _ids: &[u64]) -> Result<ChunkResult, FetchError> {
            Ok(ChunkResult::default())
        }
    }

    fn config(dir: &TempDir, total: u64, slice_size: u64) -> RunConfig {
        RunConfig {
            data_dir: dir.path().to_path_buf(),
            layout: ChunkLayout::new(50, total).unwrap(),
            workers: 2,
            slice_size,
            slice_parallelism: 2,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                request_timeout: Duration::from_secs(5),
            },
            show_progress: false,
        }
    }

    #[tokio::test]
    async fn empty_wiki_gives_empty_table() {
        let dir = TempDir::new().unwrap();
        let pipeline =
            Pipeline::new(config(&dir, 200, 75), Arc::new(EmptySource), CancellationToken::new())
                .unwrap();

        let table = pipeline.run().await.unwrap();
        assert!(table.is_empty());
        assert_eq!(pipeline.stats().fetched(), 4);
        assert_eq!(pipeline.stats().slices_computed(), 3);
    }

    #[tokio::test]
    async fn cancelled_download_reports_cancellation() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pipeline = Pipeline::new(config(&dir, 200, 100), Arc::new(EmptySource), cancel).unwrap();

        let err = pipeline.download().await.unwrap_err();
        let failure = err.downcast_ref::<ChunkFailure>().unwrap();
        assert!(failure.is_cancelled());
        assert_eq!(pipeline.stats().fetched(), 0);
    }

    #[tokio::test]
    async fn cancelled_aggregation_stops_before_slices() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pipeline = Pipeline::new(config(&dir, 200, 100), Arc::new(EmptySource), cancel).unwrap();

        assert!(pipeline.aggregate().await.is_err());
        assert!(!pipeline.slice_store().path(0).exists());
    }

    #[tokio::test]
    async fn zero_slice_size_is_rejected() {
        let dir = TempDir::new().unwrap();
        let pipeline =
            Pipeline::new(config(&dir, 200, 0), Arc::new(EmptySource), CancellationToken::new())
                .unwrap();
        assert!(pipeline.aggregate().await.is_err());
    }
}
